//! Reactive, thread-safe, output-restricted message deque.
//!
//! The pollfd/pollevents pattern follows the edge-triggered notification
//! scheme used by 0MQ's `ZMQ_EVENTS`/`ZMQ_FD` socket options: the pollfd is
//! an `eventfd(2)` that becomes readable when one of the pollevents bits is
//! newly set, and the actual condition is determined by sampling
//! [`MessageDeque::pollevents`]. Valid bits are:
//!
//! * `IN`: messages are available to pop
//! * `OUT`: messages may be pushed (always asserted; size is unlimited)
//!
//! Because notification is edge-triggered, a reactor handler must pop all
//! messages before returning, or be driven through an aggregate watcher
//! that re-samples events on every iteration (see [`crate::watcher::socket`]).
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Mutex;

use crate::errno::{self, Errno};
use crate::events::PollEvents;
use crate::message::Message;

#[derive(Debug)]
struct Inner {
    messages: VecDeque<Message>,
    pollevents: PollEvents,
    pollfd: RawFd,
    /// Mirror of the eventfd counter: 1 while the fd is raised.
    event: u64,
}

/// A FIFO of messages with head-push for re-queueing and an eventfd-based
/// readiness signal for poll loops.
#[derive(Debug)]
pub struct MessageDeque {
    inner: Mutex<Inner>,
}

impl Default for MessageDeque {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDeque {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                pollevents: PollEvents::OUT,
                pollfd: -1,
                event: 0,
            }),
        }
    }

    /// Append a message.
    pub fn push_back(&self, msg: Message) {
        let mut inner = self.lock();
        inner.assert_readable();
        inner.messages.push_back(msg);
    }

    /// Prepend a message (re-queue at the head).
    pub fn push_front(&self, msg: Message) {
        let mut inner = self.lock();
        inner.assert_readable();
        inner.messages.push_front(msg);
    }

    /// Pop the oldest message, lowering `IN` when the deque drains.
    pub fn pop_front(&self) -> Option<Message> {
        let mut inner = self.lock();
        let msg = inner.messages.pop_front();
        if msg.is_some() && inner.messages.is_empty() {
            inner.pollevents.remove(PollEvents::IN);
        }
        msg
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    /// The readiness descriptor, created lazily.
    ///
    /// Readable (edge-triggered) when a pollevents bit is newly set; primed
    /// with the current state at creation.
    pub fn pollfd(&self) -> Result<RawFd, Errno> {
        let mut inner = self.lock();
        if inner.pollfd < 0 {
            // OUT is always asserted, so the fd is born raised; the first
            // poll wakes the caller into an initial pollevents sample.
            let initval = if inner.pollevents.is_empty() { 0 } else { 1 };
            let fd = unsafe { libc::eventfd(initval, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
            if fd < 0 {
                return Err(errno::last());
            }
            inner.event = u64::from(initval);
            inner.pollfd = fd;
        }
        Ok(inner.pollfd)
    }

    /// Sample the current readiness bits, clearing the edge notification.
    pub fn pollevents(&self) -> PollEvents {
        let mut inner = self.lock();
        inner.clear_event();
        inner.pollevents
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("message deque lock poisoned")
    }
}

impl Drop for MessageDeque {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().expect("message deque lock poisoned");
        if inner.pollfd >= 0 {
            unsafe { libc::close(inner.pollfd) };
        }
    }
}

impl Inner {
    /// Assert `IN` ahead of a push, raising the eventfd on the edge.
    fn assert_readable(&mut self) {
        if !self.pollevents.contains(PollEvents::IN) {
            self.pollevents |= PollEvents::IN;
            self.raise_event();
        }
    }

    // See eventfd(2) for how signaling on the pollfd works.
    fn raise_event(&mut self) {
        if self.pollfd >= 0 && self.event == 0 {
            self.event = 1;
            let buf = 1u64.to_ne_bytes();
            unsafe {
                libc::write(self.pollfd, buf.as_ptr() as *const libc::c_void, 8);
            }
        }
    }

    fn clear_event(&mut self) {
        if self.pollfd >= 0 && self.event == 1 {
            let mut buf = [0u8; 8];
            unsafe {
                libc::read(self.pollfd, buf.as_mut_ptr() as *mut libc::c_void, 8);
            }
            self.event = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_readable(fd: RawFd) -> bool {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n == 1 && pfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn test_fifo_order_and_head_push() {
        let q = MessageDeque::new();
        q.push_back(Message::event("a"));
        q.push_back(Message::event("b"));
        q.push_front(Message::event("c"));

        assert_eq!(q.len(), 3);
        assert_eq!(q.pop_front().unwrap().topic(), Some("c"));
        assert_eq!(q.pop_front().unwrap().topic(), Some("a"));
        assert_eq!(q.pop_front().unwrap().topic(), Some("b"));
        assert!(q.pop_front().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_pollevents_edges() {
        let q = MessageDeque::new();
        assert_eq!(q.pollevents(), PollEvents::OUT);

        q.push_back(Message::event("x"));
        assert_eq!(q.pollevents(), PollEvents::OUT | PollEvents::IN);

        q.pop_front();
        assert_eq!(q.pollevents(), PollEvents::OUT);
    }

    #[test]
    fn test_pollfd_edge_triggered() {
        let q = MessageDeque::new();
        let fd = q.pollfd().unwrap();

        // Born raised (OUT is always asserted); the first sample clears it.
        assert!(poll_readable(fd));
        assert_eq!(q.pollevents(), PollEvents::OUT);
        assert!(!poll_readable(fd));

        // Empty-to-non-empty raises the fd once.
        q.push_back(Message::event("x"));
        assert!(poll_readable(fd));
        assert_eq!(q.pollevents(), PollEvents::OUT | PollEvents::IN);
        assert!(!poll_readable(fd));

        // Pushing while already non-empty is not an edge.
        q.push_back(Message::event("y"));
        assert!(!poll_readable(fd));
        assert_eq!(q.pollevents(), PollEvents::OUT | PollEvents::IN);

        // Drain, then a fresh push re-raises.
        q.pop_front();
        q.pop_front();
        assert_eq!(q.pollevents(), PollEvents::OUT);
        q.push_back(Message::event("z"));
        assert!(poll_readable(fd));
    }

    #[test]
    fn test_cross_thread_transfer() {
        let q = std::sync::Arc::new(MessageDeque::new());
        let q2 = q.clone();
        let t = std::thread::spawn(move || {
            for i in 0..100 {
                q2.push_back(Message::event(format!("m{i}")));
            }
        });
        t.join().unwrap();
        assert_eq!(q.len(), 100);
        assert_eq!(q.pop_front().unwrap().topic(), Some("m0"));
    }
}
