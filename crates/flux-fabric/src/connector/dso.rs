//! Connectors loaded from shared objects by URI scheme.
//!
//! A scheme with no builtin is resolved by searching the directories in
//! `FLUX_CONNECTOR_PATH` (colon-separated) for `<scheme>.so`, loading it
//! with `dlopen(3)` and resolving a `connector_init` symbol:
//!
//! ```c
//! extern "C" Box<dyn Connector> *connector_init(const char *path, uint32_t flags);
//! ```
//!
//! The symbol returns a raw `Box<Box<dyn Connector>>` (the double box keeps
//! the fat pointer intact across the C ABI) or null with errno set. Shared
//! objects are expected to be built with the same toolchain as the loader.
use std::ffi::{CStr, CString};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::connector::{Connector, OptValue};
use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::HandleFlags;
use crate::message::Message;

/// Symbol every connector shared object must export.
pub const CONNECTOR_INIT_SYMBOL: &str = "connector_init";

type ConnectorInitFn =
    unsafe extern "C" fn(path: *const libc::c_char, flags: u32) -> *mut Box<dyn Connector>;

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("unable to find connector name '{scheme}'")]
    NotFound { scheme: String },
    #[error("dlopen: {path}: {detail}")]
    Dlopen { path: PathBuf, detail: String },
    #[error("{path}: missing {CONNECTOR_INIT_SYMBOL} symbol")]
    MissingSymbol { path: PathBuf },
    #[error("{scheme}: connector init failed: {errno}")]
    Init { scheme: String, errno: Errno },
}

impl LoadError {
    pub fn errno(&self) -> Errno {
        match self {
            LoadError::NotFound { .. } => Errno::ENOENT,
            LoadError::Dlopen { .. } | LoadError::MissingSymbol { .. } => Errno::EINVAL,
            LoadError::Init { errno, .. } => *errno,
        }
    }
}

/// Whether DSOs are loaded with `RTLD_DEEPBIND`, per
/// `FLUX_LOAD_WITH_DEEPBIND` (default on). Latched on first use.
pub(crate) fn deepbind() -> libc::c_int {
    static DEEPBIND: OnceLock<bool> = OnceLock::new();
    let on = *DEEPBIND.get_or_init(|| match std::env::var("FLUX_LOAD_WITH_DEEPBIND") {
        Ok(v) => v.trim().parse::<i64>().map(|n| n != 0).unwrap_or(true),
        Err(_) => true,
    });
    #[cfg(target_env = "gnu")]
    {
        if on {
            return libc::RTLD_DEEPBIND;
        }
    }
    let _ = on;
    0
}

/// Search the colon-separated `searchpath` for a plain file named `name`.
pub(crate) fn find_file(name: &str, searchpath: &str) -> Option<PathBuf> {
    for dir in searchpath.split(':').filter(|d| !d.is_empty()) {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// A connector behind a `dlopen`'d shared object. The object stays loaded
/// for the life of the connector.
pub struct DsoConnector {
    inner: Option<Box<dyn Connector>>,
    dso: *mut libc::c_void,
}

impl std::fmt::Debug for DsoConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DsoConnector")
            .field("dso", &self.dso)
            .finish()
    }
}

impl DsoConnector {
    /// Resolve `scheme` against the connector search path and initialize it
    /// with the URI `path` and open flags.
    pub fn load(scheme: &str, path: &str, flags: HandleFlags) -> Result<Self, LoadError> {
        let searchpath = std::env::var("FLUX_CONNECTOR_PATH").unwrap_or_default();
        let name = format!("{scheme}.so");
        let so_path = find_file(&name, &searchpath).ok_or_else(|| LoadError::NotFound {
            scheme: scheme.to_owned(),
        })?;

        let c_path = CString::new(so_path.to_string_lossy().as_bytes()).expect("no NUL in path");
        let dso = unsafe {
            libc::dlopen(
                c_path.as_ptr(),
                libc::RTLD_LAZY | libc::RTLD_LOCAL | deepbind(),
            )
        };
        if dso.is_null() {
            return Err(LoadError::Dlopen {
                path: so_path,
                detail: dlerror_string(),
            });
        }

        let c_sym = CString::new(CONNECTOR_INIT_SYMBOL).expect("no NUL in symbol");
        let sym = unsafe { libc::dlsym(dso, c_sym.as_ptr()) };
        if sym.is_null() {
            unsafe { libc::dlclose(dso) };
            return Err(LoadError::MissingSymbol { path: so_path });
        }
        let init: ConnectorInitFn = unsafe { std::mem::transmute(sym) };

        let c_uri_path = CString::new(path).unwrap_or_default();
        let raw = unsafe { init(c_uri_path.as_ptr(), flags.raw()) };
        if raw.is_null() {
            let errno = crate::errno::last();
            unsafe { libc::dlclose(dso) };
            return Err(LoadError::Init {
                scheme: scheme.to_owned(),
                errno,
            });
        }
        log::debug!(target: "fabric::connector::dso", "Loaded connector '{scheme}' from {}", so_path.display());
        let inner = unsafe { *Box::from_raw(raw) };
        Ok(Self {
            inner: Some(inner),
            dso,
        })
    }

    fn inner(&self) -> &dyn Connector {
        self.inner.as_deref().expect("connector present until drop")
    }
}

impl Drop for DsoConnector {
    fn drop(&mut self) {
        // The connector's code lives in the DSO; destroy it first.
        self.inner = None;
        unsafe { libc::dlclose(self.dso) };
    }
}

impl Connector for DsoConnector {
    fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno> {
        self.inner().send(msg, flags)
    }

    fn send_new(&self, msg: Message, flags: HandleFlags) -> Result<(), (Message, Errno)> {
        self.inner().send_new(msg, flags)
    }

    fn recv(&self, flags: HandleFlags) -> Result<Message, Errno> {
        self.inner().recv(flags)
    }

    fn pollfd(&self) -> Result<RawFd, Errno> {
        self.inner().pollfd()
    }

    fn pollevents(&self) -> Result<PollEvents, Errno> {
        self.inner().pollevents()
    }

    fn setopt(&self, option: &str, value: OptValue) -> Result<(), Errno> {
        self.inner().setopt(option, value)
    }

    fn getopt(&self, option: &str) -> Result<OptValue, Errno> {
        self.inner().getopt(option)
    }

    fn reconnect(&self) -> Result<(), Errno> {
        self.inner().reconnect()
    }
}

fn dlerror_string() -> String {
    let err = unsafe { libc::dlerror() };
    if err.is_null() {
        "unknown dlopen error".to_owned()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_file() {
        let dir = tempfile::tempdir().unwrap();
        let so = dir.path().join("myscheme.so");
        std::fs::write(&so, "not really an so").unwrap();

        let path = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_file("myscheme.so", &path), Some(so));
        assert_eq!(find_file("other.so", &path), None);
        assert_eq!(find_file("myscheme.so", ""), None);
    }

    #[test]
    fn test_load_unknown_scheme_fails() {
        let err = DsoConnector::load("no-such-scheme", "", HandleFlags::NONE).unwrap_err();
        assert!(matches!(err, LoadError::NotFound { .. }));
        assert_eq!(err.errno(), Errno::ENOENT);
    }
}
