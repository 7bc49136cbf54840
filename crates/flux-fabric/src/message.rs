//! Typed messages.
//!
//! A message is an owned value: cloning copies it, and handing one to
//! another thread is a move. Sharing between a dispatcher and a queue is
//! done by cloning; there is no reference count to misuse.
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errno::Errno;
use crate::MATCHTAG_NONE;

/// Message type. The numeric values appear on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// A request expecting zero or more responses.
    Request = 0x01,
    /// A response correlated to a request by matchtag.
    Response = 0x02,
    /// A published event.
    Event = 0x04,
    /// Connection control; carries a `(type, status)` pair and no payload.
    Control = 0x08,
}

impl MessageType {
    /// Single-character tag used in trace output.
    pub fn tag(&self) -> char {
        match self {
            Self::Request => '>',
            Self::Response => '<',
            Self::Event => 'e',
            Self::Control => 'c',
        }
    }

    pub fn from_wire(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Response),
            0x04 => Some(Self::Event),
            0x08 => Some(Self::Control),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Event => "event",
            Self::Control => "control",
        };
        write!(f, "{s}")
    }
}

/// Message flags.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MsgFlags(u8);

impl MsgFlags {
    pub const NONE: MsgFlags = MsgFlags(0);
    /// The request expects no response.
    pub const NORESPONSE: MsgFlags = MsgFlags(1);
    /// The response is part of a series; terminated by a non-zero errnum.
    pub const STREAMING: MsgFlags = MsgFlags(2);
    /// The message must not be forwarded beyond its connection.
    pub const PRIVATE: MsgFlags = MsgFlags(4);

    pub fn contains(&self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn raw(&self) -> u8 {
        self.0
    }

    pub(crate) fn from_raw(raw: u8) -> Self {
        MsgFlags(raw & 0x7)
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: MsgFlags) -> MsgFlags {
        MsgFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for MsgFlags {
    fn bitor_assign(&mut self, rhs: MsgFlags) {
        self.0 |= rhs.0;
    }
}

/// Message credentials: the sender's userid and role mask.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Cred {
    pub userid: u32,
    pub rolemask: u32,
}

impl Cred {
    /// Instance owner role.
    pub const ROLE_OWNER: u32 = 0x1;
    /// Unprivileged user role.
    pub const ROLE_USER: u32 = 0x2;

    pub fn owner(userid: u32) -> Self {
        Self {
            userid,
            rolemask: Self::ROLE_OWNER,
        }
    }
}

/// Ordered stack of first-hop/intermediate peer uuids.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouteStack {
    enabled: bool,
    hops: Vec<String>,
}

impl RouteStack {
    /// The uuid of the message sender (first hop), if routing is enabled.
    pub fn first(&self) -> Option<&str> {
        if self.enabled {
            self.hops.first().map(String::as_str)
        } else {
            None
        }
    }

    /// The most recently pushed hop.
    pub fn last(&self) -> Option<&str> {
        if self.enabled {
            self.hops.last().map(String::as_str)
        } else {
            None
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn count(&self) -> usize {
        if self.enabled {
            self.hops.len()
        } else {
            0
        }
    }

    pub(crate) fn hops(&self) -> &[String] {
        &self.hops
    }
}

/// A typed, routable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    mtype: MessageType,
    topic: Option<String>,
    matchtag: u32,
    errnum: i32,
    control: Option<(u32, u32)>,
    route: RouteStack,
    cred: Option<Cred>,
    flags: MsgFlags,
    payload: Option<Vec<u8>>,
}

impl Message {
    fn new(mtype: MessageType) -> Self {
        Self {
            mtype,
            topic: None,
            matchtag: MATCHTAG_NONE,
            errnum: 0,
            control: None,
            route: RouteStack::default(),
            cred: None,
            flags: MsgFlags::NONE,
            payload: None,
        }
    }

    /// Create a request for the given topic.
    pub fn request(topic: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Request);
        msg.topic = Some(topic.into());
        msg
    }

    /// Create a response for the given topic.
    pub fn response(topic: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Response);
        msg.topic = Some(topic.into());
        msg
    }

    /// Create an event for the given topic.
    pub fn event(topic: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageType::Event);
        msg.topic = Some(topic.into());
        msg
    }

    /// Create a control message carrying a `(type, status)` pair.
    pub fn control(ctype: u32, status: u32) -> Self {
        let mut msg = Self::new(MessageType::Control);
        msg.control = Some((ctype, status));
        msg
    }

    /// Derive a response from a request: topic and matchtag are inherited,
    /// the route stack is reversed, and `errno` (if non-zero) marks failure.
    pub fn response_derive(request: &Message, errno: i32) -> Result<Message, Errno> {
        if request.mtype != MessageType::Request {
            return Err(Errno::EINVAL);
        }
        let mut msg = Self::new(MessageType::Response);
        msg.topic = request.topic.clone();
        msg.matchtag = request.matchtag;
        msg.errnum = errno;
        msg.flags = request.flags;
        msg.route.enabled = request.route.enabled;
        msg.route.hops = request.route.hops.iter().rev().cloned().collect();
        Ok(msg)
    }

    pub fn mtype(&self) -> MessageType {
        self.mtype
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = Some(topic.into());
    }

    pub fn matchtag(&self) -> u32 {
        self.matchtag
    }

    pub fn set_matchtag(&mut self, matchtag: u32) {
        self.matchtag = matchtag;
    }

    /// Error number carried by a failed response, else 0.
    pub fn errnum(&self) -> i32 {
        self.errnum
    }

    pub fn set_errnum(&mut self, errnum: i32) {
        self.errnum = errnum;
    }

    /// The `(type, status)` pair of a control message.
    pub fn control_pair(&self) -> Option<(u32, u32)> {
        self.control
    }

    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: MsgFlags) {
        self.flags = flags;
    }

    pub fn is_noresponse(&self) -> bool {
        self.flags.contains(MsgFlags::NORESPONSE)
    }

    pub fn is_streaming(&self) -> bool {
        self.flags.contains(MsgFlags::STREAMING)
    }

    pub fn cred(&self) -> Option<Cred> {
        self.cred
    }

    pub fn set_cred(&mut self, cred: Cred) {
        self.cred = Some(cred);
    }

    pub fn route(&self) -> &RouteStack {
        &self.route
    }

    /// Enable the route stack. Messages with routing disabled report no hops.
    pub fn route_enable(&mut self) {
        self.route.enabled = true;
    }

    pub fn route_disable(&mut self) {
        self.route.enabled = false;
        self.route.hops.clear();
    }

    /// Push a hop uuid. Enables routing implicitly.
    pub fn route_push(&mut self, uuid: impl Into<String>) {
        self.route.enabled = true;
        self.route.hops.push(uuid.into());
    }

    /// Pop the most recent hop.
    pub fn route_pop(&mut self) -> Option<String> {
        if self.route.enabled {
            self.route.hops.pop()
        } else {
            None
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.payload = Some(payload.into());
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    /// Set the payload to a UTF-8 string (e.g. an error note on a failed
    /// response).
    pub fn set_string(&mut self, s: impl Into<String>) {
        self.payload = Some(s.into().into_bytes());
    }

    /// The payload interpreted as a UTF-8 string.
    pub fn string(&self) -> Option<&str> {
        self.payload
            .as_deref()
            .and_then(|b| std::str::from_utf8(b).ok())
    }

    /// Serialize `value` as the JSON payload.
    pub fn pack<T: Serialize>(&mut self, value: &T) -> Result<(), Errno> {
        self.payload = Some(serde_json::to_vec(value).map_err(|_| Errno::EINVAL)?);
        Ok(())
    }

    /// Deserialize the JSON payload. A missing or malformed payload is a
    /// protocol error.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, Errno> {
        let bytes = self.payload.as_deref().ok_or(Errno::EPROTO)?;
        serde_json::from_slice(bytes).map_err(|_| Errno::EPROTO)
    }

    /// One-line summary used by handle tracing.
    pub fn dump(&self) -> String {
        format!(
            "{} {} tag={} route={} {}b",
            self.mtype.tag(),
            self.topic.as_deref().unwrap_or("-"),
            self.matchtag,
            self.route.count(),
            self.payload.as_ref().map(Vec::len).unwrap_or(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_derive_reverses_route() {
        let mut req = Message::request("kvs.get");
        req.set_matchtag(42);
        req.route_push("aa");
        req.route_push("bb");
        req.route_push("cc");

        let rep = Message::response_derive(&req, 0).unwrap();
        assert_eq!(rep.mtype(), MessageType::Response);
        assert_eq!(rep.topic(), Some("kvs.get"));
        assert_eq!(rep.matchtag(), 42);
        assert_eq!(
            rep.route().hops(),
            &["cc".to_string(), "bb".to_string(), "aa".to_string()]
        );
    }

    #[test]
    fn test_response_derive_requires_request() {
        let ev = Message::event("heartbeat");
        assert_eq!(Message::response_derive(&ev, 0), Err(Errno::EINVAL));
    }

    #[test]
    fn test_route_disabled_reports_nothing() {
        let mut msg = Message::request("a.b");
        assert_eq!(msg.route().first(), None);
        msg.route_push("xyz");
        assert_eq!(msg.route().first(), Some("xyz"));
        msg.route_disable();
        assert_eq!(msg.route().count(), 0);
    }

    #[test]
    fn test_pack_unpack() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Body {
            counter: i32,
        }
        let mut msg = Message::request("rpctest.incr");
        msg.pack(&serde_json::json!({ "counter": 7 })).unwrap();
        let body: Body = msg.unpack().unwrap();
        assert_eq!(body.counter, 7);
    }

    #[test]
    fn test_unpack_malformed_is_eproto() {
        let mut msg = Message::request("x");
        msg.set_payload(b"this is not json".to_vec());
        assert_eq!(msg.unpack::<serde_json::Value>().unwrap_err(), Errno::EPROTO);

        let empty = Message::request("x");
        assert_eq!(
            empty.unpack::<serde_json::Value>().unwrap_err(),
            Errno::EPROTO
        );
    }

    #[test]
    fn test_flags() {
        let mut msg = Message::request("a");
        msg.set_flags(MsgFlags::NORESPONSE | MsgFlags::STREAMING);
        assert!(msg.is_noresponse());
        assert!(msg.is_streaming());
        assert!(!msg.flags().contains(MsgFlags::PRIVATE));
    }
}
