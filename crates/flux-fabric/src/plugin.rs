//! Loadable plugins with typed argument packs.
//!
//! A plugin is a named bundle of topic handlers plus optional JSON
//! configuration, a generated uuid, and an aux table. Handlers are kept in
//! registration order; adding a handler under an existing topic string
//! replaces it in place, so later plugins can override earlier methods
//! without reordering. Lookups are exact ([`Plugin::get_handler`]) or
//! wildcard ([`Plugin::match_handler`]).
//!
//! Plugins may be loaded from shared objects exporting a `plugin_init`
//! symbol; the deepbind rule follows the connector loader.
use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::aux::Aux;
use crate::connector::dso;
use crate::errno::Errno;

/// Symbol a plugin shared object must export:
/// `extern "C" fn(*const Plugin) -> c_int`, negative on failure.
pub const PLUGIN_INIT_SYMBOL: &str = "plugin_init";

/// Plugin load flags, mapped onto `dlopen(3)` modes.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PluginFlags(u32);

impl PluginFlags {
    pub const NONE: PluginFlags = PluginFlags(0);
    /// Resolve symbols at load time rather than lazily.
    pub const RTLD_NOW: PluginFlags = PluginFlags(1);
    /// Make the plugin's symbols available to later loads.
    pub const RTLD_GLOBAL: PluginFlags = PluginFlags(2);

    pub fn contains(&self, other: PluginFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// JSON argument pack passed through plugin calls: an input document from
/// the caller, an output document from the plugin.
#[derive(Debug, Default)]
pub struct PluginArgs {
    input: Option<Value>,
    output: Option<Value>,
}

impl PluginArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in(&mut self, value: Value) {
        self.input = Some(value);
    }

    pub fn unpack_in<T: DeserializeOwned>(&self) -> Result<T, Errno> {
        let value = self.input.clone().ok_or(Errno::ENOENT)?;
        serde_json::from_value(value).map_err(|_| Errno::EPROTO)
    }

    pub fn set_out(&mut self, value: Value) {
        self.output = Some(value);
    }

    pub fn out(&self) -> Option<&Value> {
        self.output.as_ref()
    }

    pub fn unpack_out<T: DeserializeOwned>(&self) -> Result<T, Errno> {
        let value = self.output.clone().ok_or(Errno::ENOENT)?;
        serde_json::from_value(value).map_err(|_| Errno::EPROTO)
    }
}

/// Handler callback: `(plugin, topic, args)`.
pub type PluginFn = Rc<dyn Fn(&Plugin, &str, &mut PluginArgs) -> Result<(), Errno>>;

struct HandlerEntry {
    topic: String,
    cb: PluginFn,
}

/// A loadable extension with topic-glob handlers.
pub struct Plugin {
    name: RefCell<String>,
    path: RefCell<Option<PathBuf>>,
    uuid: String,
    conf: RefCell<Option<Value>>,
    aux: RefCell<Aux>,
    flags: Cell<PluginFlags>,
    handlers: RefCell<Vec<HandlerEntry>>,
    last_error: RefCell<Option<String>>,
    dso: Cell<*mut libc::c_void>,
}

impl Default for Plugin {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin {
    pub fn new() -> Self {
        Self {
            name: RefCell::new(String::new()),
            path: RefCell::new(None),
            uuid: gen_uuid(),
            conf: RefCell::new(None),
            aux: RefCell::new(Aux::new()),
            flags: Cell::new(PluginFlags::NONE),
            handlers: RefCell::new(Vec::new()),
            last_error: RefCell::new(None),
            dso: Cell::new(std::ptr::null_mut()),
        }
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.borrow_mut() = name.into();
    }

    pub fn name(&self) -> String {
        self.name.borrow().clone()
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.path.borrow().clone()
    }

    /// The plugin's generated uuid.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn set_flags(&self, flags: PluginFlags) {
        self.flags.set(flags);
    }

    pub fn flags(&self) -> PluginFlags {
        self.flags.get()
    }

    /// Install the configuration document.
    pub fn set_conf(&self, conf: Value) {
        *self.conf.borrow_mut() = Some(conf);
    }

    pub fn conf(&self) -> Option<Value> {
        self.conf.borrow().clone()
    }

    pub fn conf_unpack<T: DeserializeOwned>(&self) -> Result<T, Errno> {
        let conf = self.conf.borrow().clone().ok_or(Errno::ENOENT)?;
        serde_json::from_value(conf).map_err(|_| Errno::EPROTO)
    }

    pub fn aux_set<T: std::any::Any>(&self, key: &str, val: T) {
        self.aux.borrow_mut().set(key, val);
    }

    pub fn aux_get<T: std::any::Any + Clone>(&self, key: &str) -> Result<T, Errno> {
        self.aux.borrow().get::<T>(key).cloned()
    }

    /// Most recent error text from a failed call or load.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    fn set_last_error(&self, text: impl Into<String>) {
        *self.last_error.borrow_mut() = Some(text.into());
    }

    /// Register a handler for a topic glob. An existing handler under the
    /// same topic string is replaced in place.
    pub fn add_handler(
        &self,
        topic: impl Into<String>,
        cb: impl Fn(&Plugin, &str, &mut PluginArgs) -> Result<(), Errno> + 'static,
    ) {
        let topic = topic.into();
        let cb: PluginFn = Rc::new(cb);
        let mut handlers = self.handlers.borrow_mut();
        if let Some(entry) = handlers.iter_mut().find(|e| e.topic == topic) {
            entry.cb = cb;
        } else {
            handlers.push(HandlerEntry { topic, cb });
        }
    }

    /// Remove the handler registered under exactly `topic`.
    pub fn remove_handler(&self, topic: &str) -> bool {
        let mut handlers = self.handlers.borrow_mut();
        let before = handlers.len();
        handlers.retain(|e| e.topic != topic);
        handlers.len() != before
    }

    /// Exact-topic lookup.
    pub fn get_handler(&self, topic: &str) -> Option<PluginFn> {
        self.handlers
            .borrow()
            .iter()
            .find(|e| e.topic == topic)
            .map(|e| e.cb.clone())
    }

    /// First handler whose topic glob matches `topic`.
    pub fn match_handler(&self, topic: &str) -> Option<PluginFn> {
        self.handlers
            .borrow()
            .iter()
            .find(|e| fast_glob::glob_match(&e.topic, topic))
            .map(|e| e.cb.clone())
    }

    /// Invoke the first matching handler for `topic`. Returns whether a
    /// handler ran; a handler failure is recorded in
    /// [`Plugin::last_error`].
    pub fn call(&self, topic: &str, args: &mut PluginArgs) -> Result<bool, Errno> {
        let Some(cb) = self.match_handler(topic) else {
            return Ok(false);
        };
        match cb(self, topic, args) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.set_last_error(format!("{}: {topic} failed: {e}", self.name()));
                Err(e)
            }
        }
    }

    /// Load a plugin shared object and run its `plugin_init`.
    pub fn load_dso(&self, path: impl AsRef<Path>) -> Result<(), Errno> {
        type PluginInitFn = unsafe extern "C" fn(*const Plugin) -> libc::c_int;

        let path = path.as_ref();
        let c_path = CString::new(path.to_string_lossy().as_bytes()).map_err(|_| Errno::EINVAL)?;

        let mut mode = if self.flags.get().contains(PluginFlags::RTLD_NOW) {
            libc::RTLD_NOW
        } else {
            libc::RTLD_LAZY
        };
        mode |= if self.flags.get().contains(PluginFlags::RTLD_GLOBAL) {
            libc::RTLD_GLOBAL
        } else {
            libc::RTLD_LOCAL
        };
        mode |= dso::deepbind();

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), mode) };
        if handle.is_null() {
            self.set_last_error(format!("dlopen: {}", path.display()));
            return Err(Errno::EINVAL);
        }
        let c_sym = CString::new(PLUGIN_INIT_SYMBOL).expect("no NUL in symbol");
        let sym = unsafe { libc::dlsym(handle, c_sym.as_ptr()) };
        if sym.is_null() {
            unsafe { libc::dlclose(handle) };
            self.set_last_error(format!(
                "{}: missing {PLUGIN_INIT_SYMBOL} symbol",
                path.display()
            ));
            return Err(Errno::EINVAL);
        }
        let init: PluginInitFn = unsafe { std::mem::transmute(sym) };
        if unsafe { init(self as *const Plugin) } < 0 {
            unsafe { libc::dlclose(handle) };
            self.set_last_error(format!("{}: plugin_init failed", path.display()));
            return Err(Errno::EINVAL);
        }
        *self.path.borrow_mut() = Some(path.to_owned());
        if self.name.borrow().is_empty() {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            *self.name.borrow_mut() = stem;
        }
        self.dso.set(handle);
        log::debug!(target: "fabric::plugin", "Loaded plugin '{}' from {}", self.name(), path.display());
        Ok(())
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        // Handlers point into the DSO; drop them before unloading it.
        self.handlers.get_mut().clear();
        let dso = self.dso.get();
        if !dso.is_null() {
            unsafe { libc::dlclose(dso) };
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name())
            .field("uuid", &self.uuid)
            .field("handlers", &self.handlers.borrow().len())
            .finish()
    }
}

/// Random v4-format uuid string.
fn gen_uuid() -> String {
    let mut b = [0u8; 16];
    for byte in &mut b {
        *byte = fastrand::u8(..);
    }
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8], b[9], b[10], b[11], b[12], b[13],
        b[14], b[15]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uuid_shape() {
        let p = Plugin::new();
        let uuid = p.uuid();
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.matches('-').count(), 4);

        let q = Plugin::new();
        assert_ne!(p.uuid(), q.uuid());
    }

    #[test]
    fn test_handler_exact_and_glob() {
        let p = Plugin::new();
        p.add_handler("job.validate", |_, _, _| Ok(()));
        p.add_handler("job.*", |_, _, _| Ok(()));

        assert!(p.get_handler("job.validate").is_some());
        assert!(p.get_handler("job.frob").is_none());
        assert!(p.match_handler("job.frob").is_some());
        assert!(p.match_handler("shell.init").is_none());
    }

    #[test]
    fn test_handler_replaced_in_place() {
        let p = Plugin::new();
        p.add_handler("conf.update", |_, _, args| {
            args.set_out(json!({ "version": 1 }));
            Ok(())
        });
        p.add_handler("other.topic", |_, _, _| Ok(()));
        p.add_handler("conf.update", |_, _, args| {
            args.set_out(json!({ "version": 2 }));
            Ok(())
        });

        // Replacement kept registration order: conf.update still first.
        let mut args = PluginArgs::new();
        assert!(p.call("conf.update", &mut args).unwrap());
        assert_eq!(args.out().unwrap()["version"], 2);
        assert_eq!(p.handlers.borrow().len(), 2);
        assert_eq!(p.handlers.borrow()[0].topic, "conf.update");
    }

    #[test]
    fn test_call_args_round_trip() {
        let p = Plugin::new();
        p.add_handler("math.double", |_, _, args| {
            #[derive(serde::Deserialize)]
            struct In {
                n: i64,
            }
            let input: In = args.unpack_in()?;
            args.set_out(json!({ "n": input.n * 2 }));
            Ok(())
        });

        let mut args = PluginArgs::new();
        args.set_in(json!({ "n": 21 }));
        assert!(p.call("math.double", &mut args).unwrap());
        assert_eq!(args.out().unwrap()["n"], 42);

        assert!(!p.call("math.halve", &mut args).unwrap());
    }

    #[test]
    fn test_call_failure_sets_last_error() {
        let p = Plugin::new();
        p.set_name("validator");
        p.add_handler("job.validate", |_, _, _| Err(Errno::EINVAL));

        let mut args = PluginArgs::new();
        assert_eq!(p.call("job.validate", &mut args), Err(Errno::EINVAL));
        let err = p.last_error().unwrap();
        assert!(err.contains("validator"), "{err}");
        assert!(err.contains("job.validate"), "{err}");
    }

    #[test]
    fn test_conf() {
        let p = Plugin::new();
        assert_eq!(p.conf_unpack::<Value>(), Err(Errno::ENOENT));
        p.set_conf(json!({ "workers": 4 }));
        let conf: Value = p.conf_unpack().unwrap();
        assert_eq!(conf["workers"], 4);
    }

    #[test]
    fn test_remove_handler() {
        let p = Plugin::new();
        p.add_handler("a.b", |_, _, _| Ok(()));
        assert!(p.remove_handler("a.b"));
        assert!(!p.remove_handler("a.b"));
        assert!(p.get_handler("a.b").is_none());
    }

    #[test]
    fn test_load_missing_dso_fails() {
        let p = Plugin::new();
        assert_eq!(p.load_dso("/nonexistent/plugin.so"), Err(Errno::EINVAL));
        assert!(p.last_error().unwrap().contains("dlopen"));
    }
}
