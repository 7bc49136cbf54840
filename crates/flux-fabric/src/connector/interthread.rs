//! Thread-to-thread rendezvous connector (`interthread://name`).
//!
//! Two handles in the same process open the same endpoint name; each send
//! moves the message into the peer's receive deque, whose eventfd wakes the
//! peer's reactor. The first opener creates the pair, the second attaches,
//! a third gets `EADDRINUSE`.
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock};

use crate::connector::Connector;
use crate::deque::MessageDeque;
use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::HandleFlags;
use crate::message::Message;

struct Pair {
    /// One deque per direction; endpoint `i` receives from `queues[i]`.
    queues: [Arc<MessageDeque>; 2],
    claimed: [bool; 2],
}

fn registry() -> &'static Mutex<HashMap<String, Pair>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Pair>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct InterthreadConnector {
    name: String,
    /// Which side of the pair this endpoint is.
    side: usize,
    rx: Arc<MessageDeque>,
    tx: Arc<MessageDeque>,
}

impl std::fmt::Debug for InterthreadConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterthreadConnector")
            .field("name", &self.name)
            .field("side", &self.side)
            .finish()
    }
}

impl InterthreadConnector {
    /// Open (or create) the endpoint `name`.
    pub fn open(name: &str) -> Result<Self, Errno> {
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        let mut reg = registry().lock().expect("interthread registry lock");
        let pair = reg.entry(name.to_owned()).or_insert_with(|| Pair {
            queues: [
                Arc::new(MessageDeque::new()),
                Arc::new(MessageDeque::new()),
            ],
            claimed: [false, false],
        });
        let Some(side) = pair.claimed.iter().position(|c| !c) else {
            return Err(Errno::EADDRINUSE);
        };
        pair.claimed[side] = true;
        Ok(Self {
            name: name.to_owned(),
            side,
            rx: pair.queues[side].clone(),
            tx: pair.queues[1 - side].clone(),
        })
    }

    fn wait_readable(&self) -> Result<(), Errno> {
        let fd = self.rx.pollfd()?;
        loop {
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };
            let n = unsafe { libc::poll(&mut pfd, 1, -1) };
            if n < 0 {
                let e = crate::errno::last();
                if e == Errno::EINTR {
                    continue;
                }
                return Err(e);
            }
            return Ok(());
        }
    }
}

impl Connector for InterthreadConnector {
    fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno> {
        self.send_new(msg.clone(), flags).map_err(|(_, e)| e)
    }

    fn send_new(&self, msg: Message, _flags: HandleFlags) -> Result<(), (Message, Errno)> {
        self.tx.push_back(msg);
        Ok(())
    }

    fn recv(&self, flags: HandleFlags) -> Result<Message, Errno> {
        loop {
            if let Some(msg) = self.rx.pop_front() {
                return Ok(msg);
            }
            if flags.contains(HandleFlags::NONBLOCK) {
                return Err(Errno::EWOULDBLOCK);
            }
            self.wait_readable()?;
            // Drain the edge so the next empty wait blocks again.
            self.rx.pollevents();
        }
    }

    fn pollfd(&self) -> Result<RawFd, Errno> {
        self.rx.pollfd()
    }

    fn pollevents(&self) -> Result<PollEvents, Errno> {
        Ok(self.rx.pollevents())
    }
}

impl Drop for InterthreadConnector {
    fn drop(&mut self) {
        let mut reg = registry().lock().expect("interthread registry lock");
        if let Some(pair) = reg.get_mut(&self.name) {
            pair.claimed[self.side] = false;
            if pair.claimed == [false, false] {
                reg.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_rendezvous() {
        let a = InterthreadConnector::open("pair-test").unwrap();
        let b = InterthreadConnector::open("pair-test").unwrap();
        assert_eq!(
            InterthreadConnector::open("pair-test").unwrap_err(),
            Errno::EADDRINUSE
        );

        a.send(&Message::request("hello"), HandleFlags::NONE).unwrap();
        let got = b.recv(HandleFlags::NONE).unwrap();
        assert_eq!(got.topic(), Some("hello"));

        b.send(&Message::response("hello"), HandleFlags::NONE)
            .unwrap();
        let got = a.recv(HandleFlags::NONE).unwrap();
        assert_eq!(got.topic(), Some("hello"));
    }

    #[test]
    fn test_name_released_on_drop() {
        {
            let _a = InterthreadConnector::open("transient").unwrap();
        }
        let _b = InterthreadConnector::open("transient").unwrap();
    }

    #[test]
    fn test_nonblock_recv_drains() {
        let a = InterthreadConnector::open("nb-test").unwrap();
        let _b = InterthreadConnector::open("nb-test").unwrap();
        assert_eq!(a.recv(HandleFlags::NONBLOCK), Err(Errno::EWOULDBLOCK));
    }

    #[test]
    fn test_cross_thread_blocking_recv() {
        let a = InterthreadConnector::open("xthread").unwrap();
        let b = InterthreadConnector::open("xthread").unwrap();

        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            b.send(&Message::event("wake"), HandleFlags::NONE).unwrap();
            b
        });
        let got = a.recv(HandleFlags::NONE).unwrap();
        assert_eq!(got.topic(), Some("wake"));
        t.join().unwrap();
    }
}
