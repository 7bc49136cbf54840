//! In-process back-to-back connector (`loop://`).
//!
//! Messages sent on the handle come back on the same handle, which makes it
//! the workhorse of unit tests: register a request handler, send a request,
//! and the dispatcher routes the response right back.
use std::cell::Cell;
use std::os::unix::io::RawFd;

use crate::connector::{Connector, OptValue, OPT_TESTING_ROLEMASK, OPT_TESTING_USERID};
use crate::deque::MessageDeque;
use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::HandleFlags;
use crate::message::{Cred, Message};

pub struct LoopConnector {
    queue: MessageDeque,
    userid: Cell<u32>,
    rolemask: Cell<u32>,
}

impl LoopConnector {
    pub fn new() -> Self {
        Self {
            queue: MessageDeque::new(),
            userid: Cell::new(unsafe { libc::getuid() }),
            rolemask: Cell::new(Cred::ROLE_OWNER),
        }
    }
}

impl Default for LoopConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for LoopConnector {
    fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno> {
        self.send_new(msg.clone(), flags).map_err(|(_, e)| e)
    }

    fn send_new(&self, mut msg: Message, _flags: HandleFlags) -> Result<(), (Message, Errno)> {
        if msg.cred().is_none() {
            msg.set_cred(Cred {
                userid: self.userid.get(),
                rolemask: self.rolemask.get(),
            });
        }
        self.queue.push_back(msg);
        Ok(())
    }

    fn recv(&self, _flags: HandleFlags) -> Result<Message, Errno> {
        // Nothing ever arrives except what was sent; never block.
        self.queue.pop_front().ok_or(Errno::EWOULDBLOCK)
    }

    fn pollfd(&self) -> Result<RawFd, Errno> {
        self.queue.pollfd()
    }

    fn pollevents(&self) -> Result<PollEvents, Errno> {
        Ok(self.queue.pollevents())
    }

    fn setopt(&self, option: &str, value: OptValue) -> Result<(), Errno> {
        match option {
            OPT_TESTING_USERID => self.userid.set(value.as_u32()?),
            OPT_TESTING_ROLEMASK => self.rolemask.set(value.as_u32()?),
            _ => return Err(Errno::EINVAL),
        }
        Ok(())
    }

    fn getopt(&self, option: &str) -> Result<OptValue, Errno> {
        match option {
            OPT_TESTING_USERID => Ok(OptValue::U32(self.userid.get())),
            OPT_TESTING_ROLEMASK => Ok(OptValue::U32(self.rolemask.get())),
            _ => Err(Errno::EINVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_round_trip() {
        let c = LoopConnector::new();
        let mut msg = Message::request("echo.test");
        msg.set_matchtag(3);
        c.send(&msg, HandleFlags::NONE).unwrap();

        let got = c.recv(HandleFlags::NONE).unwrap();
        assert_eq!(got.topic(), Some("echo.test"));
        assert_eq!(got.matchtag(), 3);
        assert!(got.cred().is_some(), "loop stamps credentials");
    }

    #[test]
    fn test_recv_empty_would_block() {
        let c = LoopConnector::new();
        assert_eq!(c.recv(HandleFlags::NONE), Err(Errno::EWOULDBLOCK));
    }

    #[test]
    fn test_testing_cred_overrides() {
        let c = LoopConnector::new();
        c.setopt(OPT_TESTING_USERID, OptValue::U32(4242)).unwrap();
        c.setopt(OPT_TESTING_ROLEMASK, OptValue::U32(Cred::ROLE_USER))
            .unwrap();

        c.send(&Message::request("x"), HandleFlags::NONE).unwrap();
        let got = c.recv(HandleFlags::NONE).unwrap();
        let cred = got.cred().unwrap();
        assert_eq!(cred.userid, 4242);
        assert_eq!(cred.rolemask, Cred::ROLE_USER);
    }

    #[test]
    fn test_unknown_option_is_einval() {
        let c = LoopConnector::new();
        assert_eq!(c.getopt("no-such-option").unwrap_err(), Errno::EINVAL);
    }
}
