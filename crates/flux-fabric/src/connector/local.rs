//! Unix-domain stream connector (`local://path`).
//!
//! Frames are a 4-byte big-endian length followed by the wire-encoded
//! message. Reads accumulate into a buffer so partial frames survive
//! non-blocking receives.
use std::cell::RefCell;
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use bytes::{Buf, BytesMut};

use crate::connector::Connector;
use crate::errno::{self, Errno};
use crate::events::PollEvents;
use crate::handle::HandleFlags;
use crate::message::Message;
use crate::wire::{self, Decode, Encode};

pub struct LocalConnector {
    path: PathBuf,
    stream: RefCell<UnixStream>,
    inbox: RefCell<BytesMut>,
}

impl LocalConnector {
    /// Connect to the endpoint socket at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Errno> {
        let path = path.into();
        let stream = UnixStream::connect(&path).map_err(Errno::from)?;
        Ok(Self {
            path,
            stream: RefCell::new(stream),
            inbox: RefCell::new(BytesMut::new()),
        })
    }

    /// Pop a complete frame from the inbox, if one has accumulated.
    fn take_frame(&self) -> Result<Option<Message>, Errno> {
        let mut inbox = self.inbox.borrow_mut();
        if inbox.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([inbox[0], inbox[1], inbox[2], inbox[3]]) as usize;
        if len > wire::MAX_FRAME_SIZE {
            return Err(Errno::EPROTO);
        }
        if inbox.len() < 4 + len {
            return Ok(None);
        }
        inbox.advance(4);
        let body = inbox.split_to(len);
        let msg = Message::decode(&mut &body[..]).map_err(|e| {
            log::debug!(target: "fabric::connector::local", "Bad frame: {e}");
            Errno::EPROTO
        })?;
        Ok(Some(msg))
    }

    fn fill_inbox(&self, nonblock: bool) -> Result<(), Errno> {
        let mut stream = self.stream.borrow_mut();
        stream.set_nonblocking(nonblock).map_err(Errno::from)?;
        let mut buf = [0u8; 4096];
        match stream.read(&mut buf) {
            Ok(0) => Err(Errno::ECONNRESET),
            Ok(n) => {
                self.inbox.borrow_mut().extend_from_slice(&buf[..n]);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Connector for LocalConnector {
    fn send(&self, msg: &Message, _flags: HandleFlags) -> Result<(), Errno> {
        let body = msg.encode_to_vec();
        let mut frame = Vec::with_capacity(body.len() + 4);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);

        let mut stream = self.stream.borrow_mut();
        // Frames go out whole; writes block even on a non-blocking handle
        // so a partial frame never splits across an EAGAIN.
        stream.set_nonblocking(false).map_err(Errno::from)?;
        stream.write_all(&frame).map_err(Errno::from)?;
        Ok(())
    }

    fn recv(&self, flags: HandleFlags) -> Result<Message, Errno> {
        let nonblock = flags.contains(HandleFlags::NONBLOCK);
        loop {
            if let Some(msg) = self.take_frame()? {
                return Ok(msg);
            }
            self.fill_inbox(nonblock)?;
        }
    }

    fn pollfd(&self) -> Result<RawFd, Errno> {
        Ok(self.stream.borrow().as_raw_fd())
    }

    fn pollevents(&self) -> Result<PollEvents, Errno> {
        let mut events = PollEvents::NONE;
        if !self.inbox.borrow().is_empty() {
            events |= PollEvents::IN;
        }
        let mut pfd = libc::pollfd {
            fd: self.stream.borrow().as_raw_fd(),
            events: libc::POLLIN | libc::POLLOUT,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        if n < 0 {
            return Err(errno::last());
        }
        if n > 0 {
            if pfd.revents & libc::POLLIN != 0 {
                events |= PollEvents::IN;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                events |= PollEvents::OUT;
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP) != 0 {
                events |= PollEvents::ERR;
            }
        }
        Ok(events)
    }

    fn reconnect(&self) -> Result<(), Errno> {
        let stream = UnixStream::connect(&self.path).map_err(Errno::from)?;
        *self.stream.borrow_mut() = stream;
        self.inbox.borrow_mut().clear();
        Ok(())
    }
}
