//! Binary codec for messages crossing a stream transport.
//!
//! Frames are a 4-byte big-endian length followed by the encoded message.
//! The encoding is not negotiated; both ends of a local socket are expected
//! to run the same fabric version.
use std::string::FromUtf8Error;

use bytes::{Buf, BufMut};

use crate::message::{Cred, Message, MessageType, MsgFlags};

/// The default type we use to represent sizes on the wire.
pub type Size = u32;

/// Maximum accepted frame body, a backstop against corrupt length prefixes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum Invalid {
    #[error("invalid message type: {actual:x}")]
    MessageType { actual: u8 },
    #[error("invalid presence marker: {actual:x}")]
    Presence { actual: u8 },
    #[error("frame of {actual} bytes exceeds maximum {max}")]
    FrameSize { actual: usize, max: usize },
    #[error("UTF-8 error: {0}")]
    FromUtf8(#[from] FromUtf8Error),
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Invalid(#[from] Invalid),

    #[error("unexpected end of buffer, requested {requested} more bytes but only {available} are available")]
    UnexpectedEnd { available: usize, requested: usize },
}

impl From<bytes::TryGetError> for Error {
    fn from(
        bytes::TryGetError {
            available,
            requested,
        }: bytes::TryGetError,
    ) -> Self {
        Self::UnexpectedEnd {
            available,
            requested,
        }
    }
}

/// Things that can be encoded as binary.
pub trait Encode {
    fn encode(&self, buf: &mut impl BufMut);

    /// A convenience wrapper around [`Encode::encode`] that allocates a
    /// [`Vec`].
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// Things that can be decoded from binary.
pub trait Decode: Sized {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error>;
}

impl Encode for u8 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self);
    }
}

impl Encode for u32 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(*self);
    }
}

impl Encode for i32 {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32(*self);
    }
}

impl Encode for &str {
    fn encode(&self, buf: &mut impl BufMut) {
        (self.len() as Size).encode(buf);
        buf.put_slice(self.as_bytes());
    }
}

impl Encode for &[u8] {
    fn encode(&self, buf: &mut impl BufMut) {
        (self.len() as Size).encode(buf);
        buf.put_slice(self);
    }
}

impl Decode for u8 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u8()?)
    }
}

impl Decode for u32 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_u32()?)
    }
}

impl Decode for i32 {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        Ok(buf.try_get_i32()?)
    }
}

impl Decode for String {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        let bytes = Vec::<u8>::decode(buf)?;
        Ok(String::from_utf8(bytes).map_err(Invalid::from)?)
    }
}

impl Decode for Vec<u8> {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        let len = Size::decode(buf)? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Invalid::FrameSize {
                actual: len,
                max: MAX_FRAME_SIZE,
            }
            .into());
        }
        if buf.remaining() < len {
            return Err(Error::UnexpectedEnd {
                available: buf.remaining(),
                requested: len,
            });
        }
        let mut bytes = vec![0; len];
        buf.copy_to_slice(&mut bytes);
        Ok(bytes)
    }
}

fn encode_opt<T: Encode>(value: &Option<T>, buf: &mut impl BufMut) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            v.encode(buf);
        }
        None => buf.put_u8(0),
    }
}

fn decode_opt<T: Decode>(buf: &mut impl Buf) -> Result<Option<T>, Error> {
    match u8::decode(buf)? {
        0 => Ok(None),
        1 => Ok(Some(T::decode(buf)?)),
        actual => Err(Invalid::Presence { actual }.into()),
    }
}

impl Encode for Message {
    fn encode(&self, buf: &mut impl BufMut) {
        (self.mtype() as u8).encode(buf);
        self.flags().raw().encode(buf);
        self.matchtag().encode(buf);
        self.errnum().encode(buf);
        encode_opt(&self.topic().map(str::to_owned), buf);
        match self.control_pair() {
            Some((ctype, status)) => {
                buf.put_u8(1);
                ctype.encode(buf);
                status.encode(buf);
            }
            None => buf.put_u8(0),
        }
        buf.put_u8(self.route().is_enabled() as u8);
        (self.route().hops().len() as Size).encode(buf);
        for hop in self.route().hops() {
            hop.as_str().encode(buf);
        }
        match self.cred() {
            Some(cred) => {
                buf.put_u8(1);
                cred.userid.encode(buf);
                cred.rolemask.encode(buf);
            }
            None => buf.put_u8(0),
        }
        encode_opt(&self.payload().map(<[u8]>::to_vec), buf);
    }
}

impl Encode for Vec<u8> {
    fn encode(&self, buf: &mut impl BufMut) {
        self.as_slice().encode(buf)
    }
}

impl Encode for String {
    fn encode(&self, buf: &mut impl BufMut) {
        self.as_str().encode(buf)
    }
}

impl Decode for Message {
    fn decode(buf: &mut impl Buf) -> Result<Self, Error> {
        let type_byte = u8::decode(buf)?;
        let mtype = MessageType::from_wire(type_byte)
            .ok_or(Invalid::MessageType { actual: type_byte })?;
        let flags = MsgFlags::from_raw(u8::decode(buf)?);
        let matchtag = u32::decode(buf)?;
        let errnum = i32::decode(buf)?;
        let topic: Option<String> = decode_opt(buf)?;
        let control = match u8::decode(buf)? {
            0 => None,
            1 => {
                let ctype = u32::decode(buf)?;
                let status = u32::decode(buf)?;
                Some((ctype, status))
            }
            actual => return Err(Invalid::Presence { actual }.into()),
        };

        let mut msg = match (mtype, control) {
            (MessageType::Control, Some((ctype, status))) => Message::control(ctype, status),
            (MessageType::Control, None) => Message::control(0, 0),
            (MessageType::Request, _) => Message::request(topic.unwrap_or_default()),
            (MessageType::Response, _) => Message::response(topic.unwrap_or_default()),
            (MessageType::Event, _) => Message::event(topic.unwrap_or_default()),
        };
        msg.set_flags(flags);
        msg.set_matchtag(matchtag);
        msg.set_errnum(errnum);

        let route_enabled = u8::decode(buf)? != 0;
        let nhops = Size::decode(buf)? as usize;
        for _ in 0..nhops {
            let hop = String::decode(buf)?;
            msg.route_push(hop);
        }
        if route_enabled {
            msg.route_enable();
        }
        match u8::decode(buf)? {
            0 => {}
            1 => {
                let userid = u32::decode(buf)?;
                let rolemask = u32::decode(buf)?;
                msg.set_cred(Cred { userid, rolemask });
            }
            actual => return Err(Invalid::Presence { actual }.into()),
        }
        if let Some(payload) = decode_opt::<Vec<u8>>(buf)? {
            msg.set_payload(payload);
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let mut msg = Message::request("kvs.lookup");
        msg.set_matchtag(17);
        msg.set_flags(MsgFlags::STREAMING);
        msg.route_push("uuid-1");
        msg.route_push("uuid-2");
        msg.set_cred(Cred {
            userid: 100,
            rolemask: Cred::ROLE_USER,
        });
        msg.set_payload(b"{\"key\":\"a.b\"}".to_vec());

        let bytes = msg.encode_to_vec();
        let decoded = Message::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_control_round_trip() {
        let msg = Message::control(3, 130);
        let bytes = msg.encode_to_vec();
        let decoded = Message::decode(&mut &bytes[..]).unwrap();
        assert_eq!(decoded.control_pair(), Some((3, 130)));
    }

    #[test]
    fn test_truncated_fails() {
        let mut msg = Message::event("heartbeat");
        msg.set_payload(vec![0u8; 64]);
        let bytes = msg.encode_to_vec();
        let err = Message::decode(&mut &bytes[..bytes.len() - 8]).unwrap_err();
        assert!(matches!(err, Error::UnexpectedEnd { .. }));
    }

    #[test]
    fn test_bad_type_rejected() {
        let bytes = vec![0x77u8; 16];
        assert!(Message::decode(&mut &bytes[..]).is_err());
    }
}
