//! Unix signal delivery over a self-pipe.
//!
//! A process-global handler installed with `sigaction` writes the signal
//! number as a single byte into a non-blocking pipe. The read end is exposed
//! for registration in a poll loop. Only async-signal-safe calls are made
//! from the handler (`write(2)`).
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Mutex;

use crate::Signal;

/// Write end of the self-pipe, or -1 before [`install`] runs.
static PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);
/// Read end of the self-pipe, or -1 before [`install`] runs.
static PIPE_READ: AtomicI32 = AtomicI32::new(-1);
/// Serializes handler installation.
static INSTALL: Mutex<()> = Mutex::new(());

impl Signal {
    /// The raw signal number.
    pub fn as_raw(&self) -> i32 {
        match self {
            Self::Interrupt => libc::SIGINT,
            Self::Terminate => libc::SIGTERM,
            Self::Hangup => libc::SIGHUP,
            Self::Child => libc::SIGCHLD,
            Self::User1 => libc::SIGUSR1,
            Self::User2 => libc::SIGUSR2,
            Self::Alarm => libc::SIGALRM,
            Self::Other(n) => *n,
        }
    }

    /// Convert from a raw signal number.
    pub fn from_raw(n: i32) -> Self {
        match n {
            _ if n == libc::SIGINT => Self::Interrupt,
            _ if n == libc::SIGTERM => Self::Terminate,
            _ if n == libc::SIGHUP => Self::Hangup,
            _ if n == libc::SIGCHLD => Self::Child,
            _ if n == libc::SIGUSR1 => Self::User1,
            _ if n == libc::SIGUSR2 => Self::User2,
            _ if n == libc::SIGALRM => Self::Alarm,
            n => Self::Other(n),
        }
    }
}

extern "C" fn handler(signum: libc::c_int) {
    let fd = PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signum as u8;
        // If the pipe is full the signal is coalesced with a pending one.
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn init_pipe() -> io::Result<()> {
    if PIPE_READ.load(Ordering::Relaxed) >= 0 {
        return Ok(());
    }
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    PIPE_READ.store(fds[0], Ordering::Relaxed);
    PIPE_WRITE.store(fds[1], Ordering::Relaxed);
    Ok(())
}

/// Install the self-pipe handler for the given signals.
///
/// Idempotent per signal. Signals not listed keep their prior disposition.
pub fn install(signals: &[Signal]) -> io::Result<()> {
    let _guard = INSTALL.lock().expect("signal install lock");

    init_pipe()?;

    for signal in signals {
        let mut sa: libc::sigaction = unsafe { std::mem::zeroed() };
        sa.sa_sigaction = handler as extern "C" fn(libc::c_int) as usize;
        sa.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(signal.as_raw(), &sa, std::ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        log::debug!(target: "signals", "Installed handler for signal {}", signal.as_raw());
    }
    Ok(())
}

/// Read end of the self-pipe, for registration in a poll loop.
///
/// Each delivered signal appears as one byte holding the raw signal number.
/// Returns an error if [`install`] has not run yet.
pub fn pipe_fd() -> io::Result<RawFd> {
    let fd = PIPE_READ.load(Ordering::Relaxed);
    if fd < 0 {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "signal handler not installed",
        ));
    }
    Ok(fd)
}

/// Drain pending signal bytes from the pipe.
pub fn drain() -> Vec<Signal> {
    let mut signals = Vec::new();
    let fd = PIPE_READ.load(Ordering::Relaxed);
    if fd < 0 {
        return signals;
    }
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        for &b in &buf[..n as usize] {
            signals.push(Signal::from_raw(b as i32));
        }
    }
    signals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_round_trip() {
        for sig in [
            Signal::Interrupt,
            Signal::Terminate,
            Signal::Hangup,
            Signal::Child,
            Signal::User1,
            Signal::User2,
            Signal::Alarm,
        ] {
            assert_eq!(Signal::from_raw(sig.as_raw()), sig);
        }
        assert_eq!(Signal::Other(64).as_raw(), 64);
    }

    #[test]
    fn test_install_and_raise() {
        install(&[Signal::User1]).unwrap();
        assert!(pipe_fd().is_ok());

        unsafe { libc::raise(libc::SIGUSR1) };

        let signals = drain();
        assert!(signals.contains(&Signal::User1));
    }
}
