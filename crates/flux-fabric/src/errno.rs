//! POSIX error numbers as values.
//!
//! Failures in this fabric travel by value: across the wire in response
//! messages, inside future result cells, and through connector return paths.
//! A plain error code with an optional human-readable string is the contract
//! (there is no exceptional control flow), so the error type is a thin
//! newtype over the OS error number rather than a closed enum, since connectors
//! loaded at runtime may surface codes this crate never names.
use std::fmt;

/// A POSIX error number.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const EPERM: Errno = Errno(libc::EPERM);
    pub const ENOENT: Errno = Errno(libc::ENOENT);
    pub const EINTR: Errno = Errno(libc::EINTR);
    pub const EIO: Errno = Errno(libc::EIO);
    pub const EAGAIN: Errno = Errno(libc::EAGAIN);
    pub const EWOULDBLOCK: Errno = Errno(libc::EAGAIN);
    pub const ENOMEM: Errno = Errno(libc::ENOMEM);
    pub const EEXIST: Errno = Errno(libc::EEXIST);
    pub const EINVAL: Errno = Errno(libc::EINVAL);
    pub const ENFILE: Errno = Errno(libc::ENFILE);
    pub const EMFILE: Errno = Errno(libc::EMFILE);
    pub const ENOSYS: Errno = Errno(libc::ENOSYS);
    pub const ENODATA: Errno = Errno(libc::ENODATA);
    pub const EPROTO: Errno = Errno(libc::EPROTO);
    pub const EADDRINUSE: Errno = Errno(libc::EADDRINUSE);
    pub const ECONNRESET: Errno = Errno(libc::ECONNRESET);
    pub const ENOBUFS: Errno = Errno(libc::ENOBUFS);
    pub const ETIMEDOUT: Errno = Errno(libc::ETIMEDOUT);
    pub const EHOSTUNREACH: Errno = Errno(libc::EHOSTUNREACH);
    pub const EDEADLOCK: Errno = Errno(libc::EDEADLK);
    pub const ENAMETOOLONG: Errno = Errno(libc::ENAMETOOLONG);
    pub const EFBIG: Errno = Errno(libc::EFBIG);

    /// The raw error number.
    pub fn raw(&self) -> i32 {
        self.0
    }

    /// True for the codes a non-blocking receive drains on.
    pub fn is_would_block(&self) -> bool {
        self.0 == libc::EAGAIN || self.0 == libc::EWOULDBLOCK
    }

    /// The `strerror(3)` text for this error number.
    pub fn strerror(&self) -> &'static str {
        match self.0 {
            0 => "Success",
            libc::EPERM => "Operation not permitted",
            libc::ENOENT => "No such file or directory",
            libc::EINTR => "Interrupted system call",
            libc::EIO => "Input/output error",
            libc::EAGAIN => "Resource temporarily unavailable",
            libc::ENOMEM => "Cannot allocate memory",
            libc::EEXIST => "File exists",
            libc::EINVAL => "Invalid argument",
            libc::ENFILE => "Too many open files in system",
            libc::EMFILE => "Too many open files",
            libc::ENOSYS => "Function not implemented",
            libc::ENODATA => "No data available",
            libc::EPROTO => "Protocol error",
            libc::EADDRINUSE => "Address already in use",
            libc::ECONNRESET => "Connection reset by peer",
            libc::ENOBUFS => "No buffer space available",
            libc::ETIMEDOUT => "Connection timed out",
            libc::EHOSTUNREACH => "No route to host",
            libc::EDEADLK => "Resource deadlock avoided",
            libc::ENAMETOOLONG => "File name too long",
            libc::EFBIG => "File too large",
            libc::EPIPE => "Broken pipe",
            libc::ECONNREFUSED => "Connection refused",
            libc::ENOTCONN => "Transport endpoint is not connected",
            _ => "Unknown error",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.strerror())
    }
}

impl fmt::Debug for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Errno({}: {})", self.0, self.strerror())
    }
}

impl std::error::Error for Errno {}

impl From<std::io::Error> for Errno {
    fn from(e: std::io::Error) -> Self {
        Errno(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

impl From<Errno> for std::io::Error {
    fn from(e: Errno) -> Self {
        std::io::Error::from_raw_os_error(e.0)
    }
}

/// Grab the calling thread's `errno` after a failed libc call.
pub(crate) fn last() -> Errno {
    Errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO))
}
