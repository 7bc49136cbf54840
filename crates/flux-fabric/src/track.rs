//! In-flight RPC tracking.
//!
//! Ensures every tracked request gets a response: either the real one, or a
//! synthesized failure when the peer disappears. Requests are hashed by
//! `(first-hop uuid, matchtag)` as they are sent; terminating responses
//! remove them; a `*.disconnect` request sweeps every entry from the same
//! sender; `purge` drains the table through a callback so the owner can
//! requeue synthesized error responses.
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::message::{Message, MessageType};
use crate::MATCHTAG_NONE;

/// Hash key: sender uuid (empty when unrouted) plus matchtag.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Key {
    uuid: String,
    matchtag: u32,
}

impl Key {
    fn from_msg(msg: &Message) -> Self {
        Self {
            uuid: msg.route().first().unwrap_or("").to_owned(),
            matchtag: msg.matchtag(),
        }
    }

    /// 33-ary modified-Bernstein fingerprint over the uuid bytes followed
    /// by the matchtag's big-endian bytes.
    fn fingerprint(&self) -> u64 {
        let mut h: u64 = 0;
        for &b in self.uuid.as_bytes() {
            h = h.wrapping_mul(33) ^ u64::from(b);
        }
        for &b in &self.matchtag.to_be_bytes() {
            h = h.wrapping_mul(33) ^ u64::from(b);
        }
        h
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fingerprint());
    }
}

/// Tracker of requests awaiting responses.
#[derive(Debug, Default)]
pub struct RpcTracker {
    hash: HashMap<Key, Message>,
}

/// True for responses that terminate an RPC: any non-streaming response, or
/// a streaming response carrying an error.
fn response_is_terminating(msg: &Message) -> bool {
    !msg.is_streaming() || msg.errnum() != 0
}

/// True for requests whose topic's final component is "disconnect".
fn request_is_disconnect(msg: &Message) -> bool {
    msg.topic()
        .map(|t| t.ends_with(".disconnect"))
        .unwrap_or(false)
}

/// Messages without a real matchtag have ambiguous keys and are skipped.
fn message_is_hashable(msg: &Message) -> bool {
    msg.matchtag() != MATCHTAG_NONE
}

impl RpcTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe a sent or received message and update the table.
    pub fn update(&mut self, msg: &Message) {
        match msg.mtype() {
            MessageType::Response => {
                if message_is_hashable(msg) && response_is_terminating(msg) {
                    self.hash.remove(&Key::from_msg(msg));
                }
            }
            MessageType::Request => {
                if !msg.is_noresponse() && message_is_hashable(msg) {
                    self.hash.insert(Key::from_msg(msg), msg.clone());
                } else if request_is_disconnect(msg) {
                    self.disconnect(msg);
                }
            }
            _ => {}
        }
    }

    /// Remove every entry whose first-hop uuid matches the disconnect
    /// sender's.
    fn disconnect(&mut self, msg: &Message) {
        let Some(uuid) = msg.route().first() else {
            return;
        };
        let uuid = uuid.to_owned();
        self.hash.retain(|key, _| key.uuid != uuid);
    }

    /// Invoke `f` for every tracked request and empty the table.
    pub fn purge(&mut self, mut f: impl FnMut(&Message)) {
        for (_, msg) in self.hash.drain() {
            f(&msg);
        }
    }

    pub fn count(&self) -> usize {
        self.hash.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errno::Errno;
    use crate::message::MsgFlags;

    fn request(uuid: &str, matchtag: u32, topic: &str) -> Message {
        let mut msg = Message::request(topic);
        msg.set_matchtag(matchtag);
        if !uuid.is_empty() {
            msg.route_push(uuid);
        }
        msg
    }

    fn response(uuid: &str, matchtag: u32) -> Message {
        let mut msg = Message::response("some.topic");
        msg.set_matchtag(matchtag);
        if !uuid.is_empty() {
            msg.route_push(uuid);
        }
        msg
    }

    #[test]
    fn test_request_then_response() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", 1, "kvs.get"));
        assert_eq!(rt.count(), 1);

        rt.update(&response("uuid-a", 1));
        assert_eq!(rt.count(), 0);
    }

    #[test]
    fn test_unhashable_messages_skipped() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", MATCHTAG_NONE, "alloc"));
        assert_eq!(rt.count(), 0);

        let mut noresp = request("uuid-a", 2, "kvs.put");
        noresp.set_flags(MsgFlags::NORESPONSE);
        rt.update(&noresp);
        assert_eq!(rt.count(), 0);
    }

    #[test]
    fn test_streaming_response_keeps_entry_until_error() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", 3, "job.events"));

        let mut stream = response("uuid-a", 3);
        stream.set_flags(MsgFlags::STREAMING);
        rt.update(&stream);
        assert_eq!(rt.count(), 1, "streaming success does not terminate");

        let mut last = response("uuid-a", 3);
        last.set_flags(MsgFlags::STREAMING);
        last.set_errnum(Errno::ENODATA.raw());
        rt.update(&last);
        assert_eq!(rt.count(), 0, "streaming error terminates");
    }

    #[test]
    fn test_disconnect_sweeps_by_uuid() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", 1, "kvs.get"));
        rt.update(&request("uuid-a", 2, "kvs.get"));
        rt.update(&request("uuid-b", 1, "kvs.get"));
        assert_eq!(rt.count(), 3);

        // Fire-and-forget disconnect for uuid-a only.
        let mut disc = Message::request("shell.disconnect");
        disc.set_flags(MsgFlags::NORESPONSE);
        disc.route_push("uuid-a");
        rt.update(&disc);
        assert_eq!(rt.count(), 1);
    }

    #[test]
    fn test_same_matchtag_different_uuid_coexist() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", 7, "a"));
        rt.update(&request("uuid-b", 7, "b"));
        assert_eq!(rt.count(), 2);

        rt.update(&response("uuid-a", 7));
        assert_eq!(rt.count(), 1);
    }

    #[test]
    fn test_purge_drains_all() {
        let mut rt = RpcTracker::new();
        rt.update(&request("uuid-a", 1, "t.a"));
        rt.update(&request("uuid-a", 2, "t.b"));

        let mut purged = Vec::new();
        rt.purge(|msg| purged.push(msg.matchtag()));
        purged.sort_unstable();
        assert_eq!(purged, vec![1, 2]);
        assert_eq!(rt.count(), 0);
    }

    #[test]
    fn test_fingerprint_stable() {
        // The 33-ary modified-Bernstein hash over "ab" then tag 1:
        // ((((97*33)^98)*33)^0)... spot-check it differs across inputs and
        // is stable for equal keys.
        let k1 = Key {
            uuid: "ab".into(),
            matchtag: 1,
        };
        let k2 = Key {
            uuid: "ab".into(),
            matchtag: 1,
        };
        let k3 = Key {
            uuid: "ab".into(),
            matchtag: 2,
        };
        assert_eq!(k1.fingerprint(), k2.fingerprint());
        assert_ne!(k1.fingerprint(), k3.fingerprint());

        let mut h: u64 = 0;
        for &b in b"ab" {
            h = h.wrapping_mul(33) ^ u64::from(b);
        }
        for &b in &1u32.to_be_bytes() {
            h = h.wrapping_mul(33) ^ u64::from(b);
        }
        assert_eq!(k1.fingerprint(), h);
    }
}
