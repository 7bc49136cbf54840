//! Pluggable transport backends for message handles.
//!
//! A connector implements a small operations table behind a trait object.
//! Three builtins are always available: `loop` (in-process back-to-back
//! pair, for testing), `interthread` (rendezvous between two handles in the
//! same process) and `local` (unix-domain stream to a broker endpoint).
//! Other schemes are loaded from shared objects at runtime (see [`dso`]).
pub mod dso;
pub mod interthread;
pub mod local;
pub mod loopback;

use std::os::unix::io::RawFd;

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::HandleFlags;
use crate::message::Message;

/// Option value for [`Connector::setopt`]/[`Connector::getopt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptValue {
    U32(u32),
    Bytes(Vec<u8>),
    Str(String),
}

impl OptValue {
    pub fn as_u32(&self) -> Result<u32, Errno> {
        match self {
            OptValue::U32(n) => Ok(*n),
            OptValue::Str(s) => s.parse().map_err(|_| Errno::EINVAL),
            OptValue::Bytes(_) => Err(Errno::EINVAL),
        }
    }

    pub fn as_str(&self) -> Result<&str, Errno> {
        match self {
            OptValue::Str(s) => Ok(s),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Testing override for the userid stamped on messages.
pub const OPT_TESTING_USERID: &str = "testing-userid";
/// Testing override for the rolemask stamped on messages.
pub const OPT_TESTING_ROLEMASK: &str = "testing-rolemask";
/// URI of the enclosing instance's parent, for hierarchical opens.
pub const OPT_PARENT_URI: &str = "parent-uri";
/// Depth of the enclosing instance in the hierarchy.
pub const OPT_INSTANCE_LEVEL: &str = "instance-level";

/// Transport operations behind a handle.
///
/// Implementations use interior mutability; a connector is driven from one
/// thread at a time through its owning handle.
pub trait Connector {
    /// Enqueue a message for transmission. May block unless
    /// `flags` contains `NONBLOCK`.
    fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno>;

    /// Like [`Connector::send`], transferring ownership. On failure the
    /// message comes back so the caller may retry. The default
    /// implementation copies through `send`; transports with a cheaper
    /// move path override it.
    fn send_new(&self, msg: Message, flags: HandleFlags) -> Result<(), (Message, Errno)> {
        match self.send(&msg, flags) {
            Ok(()) => Ok(()),
            Err(e) => Err((msg, e)),
        }
    }

    /// Return the next message, or fail with `EAGAIN`/`EWOULDBLOCK` in
    /// non-blocking mode when drained.
    fn recv(&self, flags: HandleFlags) -> Result<Message, Errno>;

    /// A descriptor readable when [`Connector::pollevents`] may change.
    fn pollfd(&self) -> Result<RawFd, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Sample the current readiness bits.
    fn pollevents(&self) -> Result<PollEvents, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Set an option; unknown options fail with `EINVAL`.
    fn setopt(&self, option: &str, _value: OptValue) -> Result<(), Errno> {
        let _ = option;
        Err(Errno::EINVAL)
    }

    /// Get an option; unknown options fail with `EINVAL`.
    fn getopt(&self, option: &str) -> Result<OptValue, Errno> {
        let _ = option;
        Err(Errno::EINVAL)
    }

    /// Attempt to reestablish the transport.
    fn reconnect(&self) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }
}
