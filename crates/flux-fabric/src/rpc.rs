//! Request/response convenience layer over handles and futures.
//!
//! [`rpc`] sends a request correlated by a freshly allocated matchtag and
//! returns a [`Future`] fulfilled by the response: with the response
//! message on success, or with the response's error number (and optional
//! payload note) on failure. Streaming RPCs fulfill repeatedly (callers
//! [`Future::reset`] between results) and terminate on any error,
//! conventionally `ENODATA`.
//!
//! The matchtag is returned to the pool when the future drops, provided the
//! terminal response was seen; otherwise it stays allocated so a straggler
//! response cannot be matched against a reused tag.
use std::cell::Cell;
use std::rc::Rc;

use serde::de::DeserializeOwned;

use crate::dispatch::{Match, MessageHandler};
use crate::errno::Errno;
use crate::future::Future;
use crate::handle::{Handle, HandleFlags, WeakHandle};
use crate::message::{Message, MsgFlags};
use crate::MATCHTAG_NONE;

/// RPC request flags.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RpcFlags(u32);

impl RpcFlags {
    pub const NONE: RpcFlags = RpcFlags(0);
    /// Fire and forget; the returned future is pre-fulfilled.
    pub const NORESPONSE: RpcFlags = RpcFlags(1);
    /// Expect a response series terminated by an error (`ENODATA` when the
    /// series simply ends).
    pub const STREAMING: RpcFlags = RpcFlags(2);

    pub fn contains(&self, other: RpcFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Frees the matchtag at future teardown once the RPC has terminated.
struct MatchtagRetire {
    handle: WeakHandle,
    matchtag: u32,
    terminated: Rc<Cell<bool>>,
}

impl Drop for MatchtagRetire {
    fn drop(&mut self) {
        if self.matchtag == MATCHTAG_NONE {
            return;
        }
        if !self.terminated.get() {
            // A response may still arrive; leak the tag rather than let it
            // be reused and mismatched.
            log::debug!(target: "fabric::rpc", "Leaking matchtag {} of unterminated RPC", self.matchtag);
            return;
        }
        if let Some(h) = self.handle.upgrade() {
            h.matchtag_free(self.matchtag);
        }
    }
}

/// Send a request and return a future for the response(s).
pub fn rpc(
    handle: &Handle,
    topic: &str,
    payload: Option<&serde_json::Value>,
    flags: RpcFlags,
) -> Result<Future, Errno> {
    let mut msg = Message::request(topic);
    if let Some(payload) = payload {
        msg.pack(payload)?;
    }
    let mut msg_flags = MsgFlags::NONE;
    if flags.contains(RpcFlags::NORESPONSE) {
        msg_flags |= MsgFlags::NORESPONSE;
    }
    if flags.contains(RpcFlags::STREAMING) {
        msg_flags |= MsgFlags::STREAMING;
    }
    msg.set_flags(msg_flags);

    if flags.contains(RpcFlags::NORESPONSE) {
        handle.send(&msg, HandleFlags::NONE)?;
        let f = Future::new();
        f.set_handle(handle)?;
        f.fulfill(());
        return Ok(f);
    }

    let matchtag = handle.matchtag_alloc();
    if matchtag == MATCHTAG_NONE {
        return Err(Errno::ENOMEM);
    }
    msg.set_matchtag(matchtag);
    if let Err(e) = handle.send(&msg, HandleFlags::NONE) {
        handle.matchtag_free(matchtag);
        return Err(e);
    }

    let streaming = flags.contains(RpcFlags::STREAMING);
    let terminated = Rc::new(Cell::new(false));

    let f = Future::with_init({
        let terminated = terminated.clone();
        move |f| {
            let Ok(h) = f.handle() else {
                f.fulfill_error(Errno::EINVAL, Some("rpc future has no handle".into()));
                return;
            };
            let weak = f.downgrade();
            let terminated = terminated.clone();
            let mh = MessageHandler::new(&h, Match::response().matchtag(matchtag), {
                move |_, mh, msg| {
                    let Some(f) = weak.upgrade() else { return };
                    if msg.errnum() != 0 {
                        terminated.set(true);
                        let errstr = msg.string().filter(|s| !s.is_empty()).map(str::to_owned);
                        f.fulfill_error(Errno(msg.errnum()), errstr);
                    } else {
                        if !streaming {
                            terminated.set(true);
                        }
                        f.fulfill_rc(Rc::new(msg.clone()));
                    }
                    // No more responses are coming; let the dispatcher
                    // quiesce.
                    if terminated.get() {
                        mh.stop();
                    }
                }
            });
            match mh {
                Ok(mh) => {
                    mh.start();
                    f.aux_append(mh);
                }
                Err(e) => f.fulfill_error(e, Some("error registering response handler".into())),
            }
        }
    });
    f.set_handle(handle)?;
    f.aux_append(MatchtagRetire {
        handle: handle.downgrade(),
        matchtag,
        terminated,
    });
    Ok(f)
}

impl Future {
    /// Block for the response message of a successful RPC.
    pub fn rpc_get(&self) -> Result<Rc<Message>, Errno> {
        self.get()?.downcast::<Message>().map_err(|_| Errno::EINVAL)
    }

    /// Block for the response and deserialize its JSON payload.
    pub fn rpc_get_unpack<T: DeserializeOwned>(&self) -> Result<T, Errno> {
        self.rpc_get()?.unpack()
    }
}

impl Handle {
    /// Respond to a request with an optional JSON payload. A no-op for
    /// requests flagged noresponse.
    pub fn respond(&self, request: &Message, payload: Option<&serde_json::Value>) -> Result<(), Errno> {
        if request.is_noresponse() {
            return Ok(());
        }
        let mut rep = Message::response_derive(request, 0)?;
        if let Some(payload) = payload {
            rep.pack(payload)?;
        }
        self.send(&rep, HandleFlags::NONE)
    }

    /// Respond to a request with an error and optional note. A no-op for
    /// requests flagged noresponse.
    pub fn respond_error(
        &self,
        request: &Message,
        errno: Errno,
        note: Option<&str>,
    ) -> Result<(), Errno> {
        if request.is_noresponse() {
            return Ok(());
        }
        let mut rep = Message::response_derive(request, errno.raw())?;
        if let Some(note) = note {
            rep.set_string(note);
        }
        self.send(&rep, HandleFlags::NONE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::RunFlags;
    use serde_json::json;

    fn open_loop() -> Handle {
        Handle::open(Some("loop://"), HandleFlags::NONE).unwrap()
    }

    /// Register the classic increment service: unpacks `{counter: n}` and
    /// responds with `{counter: n + 1}`.
    fn register_incr(h: &Handle) -> MessageHandler {
        let mh = MessageHandler::new(h, Match::request().topic("rpctest.incr"), {
            |h: &Handle, _: &MessageHandler, msg: &Message| {
                #[derive(serde::Deserialize)]
                struct Body {
                    counter: i32,
                }
                match msg.unpack::<Body>() {
                    Ok(body) => h
                        .respond(msg, Some(&json!({ "counter": body.counter + 1 })))
                        .unwrap(),
                    Err(e) => h.respond_error(msg, e, None).unwrap(),
                }
            }
        })
        .unwrap();
        mh.start();
        mh
    }

    /// Run the test services on an interthread endpoint in a thread of
    /// their own, the way a broker-side module would. Returns once the
    /// server is accepting requests.
    fn spawn_server(name: &'static str) -> std::thread::JoinHandle<()> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            let h = Handle::open(Some(&format!("interthread://{name}")), HandleFlags::NONE)
                .unwrap();
            let r = h.reactor().unwrap();
            let _incr = register_incr(&h);

            let seq = MessageHandler::new(&h, Match::request().topic("seq.fetch"), {
                |h: &Handle, _: &MessageHandler, msg: &Message| {
                    for i in 0..3 {
                        let mut rep = Message::response_derive(msg, 0).unwrap();
                        rep.pack(&json!({ "seq": i })).unwrap();
                        h.send(&rep, HandleFlags::NONE).unwrap();
                    }
                    h.respond_error(msg, Errno::ENODATA, None).unwrap();
                }
            })
            .unwrap();
            seq.start();

            let stop = MessageHandler::new(&h, Match::request().topic("test.shutdown"), {
                let r = r.clone();
                move |_: &Handle, _: &MessageHandler, _: &Message| r.stop()
            })
            .unwrap();
            stop.start();

            ready_tx.send(()).unwrap();
            r.run(RunFlags::Default).unwrap();
        });
        ready_rx.recv().unwrap();
        t
    }

    fn connect(name: &str) -> Handle {
        Handle::open(Some(&format!("interthread://{name}")), HandleFlags::NONE).unwrap()
    }

    fn shutdown(h: &Handle, t: std::thread::JoinHandle<()>) {
        rpc(h, "test.shutdown", None, RpcFlags::NORESPONSE).unwrap();
        t.join().unwrap();
    }

    #[test]
    fn test_rpc_now() {
        let t = spawn_server("rpc-now");
        let h = connect("rpc-now");

        let f = rpc(&h, "rpctest.incr", Some(&json!({ "counter": 0 })), RpcFlags::NONE).unwrap();
        #[derive(serde::Deserialize)]
        struct Body {
            counter: i32,
        }
        let body: Body = f.rpc_get_unpack().unwrap();
        assert_eq!(body.counter, 1);

        shutdown(&h, t);
    }

    #[test]
    fn test_rpc_then() {
        // Then-mode works against a service on the same handle: one
        // reactor drives both the request and the response dispatch.
        let h = open_loop();
        let r = h.reactor().unwrap();
        let _mh = register_incr(&h);

        let f = rpc(&h, "rpctest.incr", Some(&json!({ "counter": 5 })), RpcFlags::NONE).unwrap();
        let got = Rc::new(Cell::new(0));
        f.then(None, {
            let got = got.clone();
            move |f| {
                let v: serde_json::Value = f.rpc_get_unpack().unwrap();
                got.set(v["counter"].as_i64().unwrap());
                // The incr service handler stays registered; stop the loop
                // explicitly.
                f.reactor().unwrap().stop();
            }
        })
        .unwrap();

        assert!(r.run(RunFlags::Default).is_ok());
        assert_eq!(got.get(), 6);
    }

    #[test]
    fn test_rpc_error_response() {
        let t = spawn_server("rpc-eproto");
        let h = connect("rpc-eproto");

        // Malformed payload: the service responds EPROTO.
        let f = rpc(&h, "rpctest.incr", Some(&json!({ "wrong": true })), RpcFlags::NONE).unwrap();
        assert_eq!(f.rpc_get().unwrap_err(), Errno::EPROTO);
        assert_eq!(f.error_string().as_deref(), Some("Protocol error"));

        shutdown(&h, t);
    }

    #[test]
    fn test_rpc_unhandled_is_enosys() {
        let t = spawn_server("rpc-enosys");
        let h = connect("rpc-enosys");

        let f = rpc(&h, "no.such.service", None, RpcFlags::NONE).unwrap();
        assert_eq!(f.rpc_get().unwrap_err(), Errno::ENOSYS);
        assert_eq!(f.error_string().as_deref(), Some("Unhandled request"));

        shutdown(&h, t);
    }

    #[test]
    fn test_rpc_noresponse() {
        let h = open_loop();
        let f = rpc(&h, "fire.and.forget", None, RpcFlags::NORESPONSE).unwrap();
        assert!(f.is_ready());
        f.get().unwrap();

        // The request is flagged noresponse and carries no matchtag.
        let req = h.recv(&Match::any(), HandleFlags::NONE).unwrap();
        assert!(req.is_noresponse());
        assert_eq!(req.matchtag(), MATCHTAG_NONE);
    }

    #[test]
    fn test_rpc_streaming() {
        let t = spawn_server("rpc-stream");
        let h = connect("rpc-stream");

        let f = rpc(&h, "seq.fetch", None, RpcFlags::STREAMING).unwrap();
        let mut seen = Vec::new();
        loop {
            match f.rpc_get_unpack::<serde_json::Value>() {
                Ok(v) => {
                    seen.push(v["seq"].as_i64().unwrap());
                    f.reset();
                }
                Err(e) => {
                    assert_eq!(e, Errno::ENODATA);
                    break;
                }
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);

        shutdown(&h, t);
    }

    #[test]
    fn test_matchtag_retired_after_response() {
        let t = spawn_server("rpc-tags");
        let h = connect("rpc-tags");
        let avail = h.matchtag_avail();

        let f = rpc(&h, "rpctest.incr", Some(&json!({ "counter": 0 })), RpcFlags::NONE).unwrap();
        assert_eq!(h.matchtag_avail(), avail - 1);
        f.rpc_get().unwrap();
        drop(f);
        assert_eq!(h.matchtag_avail(), avail, "tag returned after terminal response");

        shutdown(&h, t);
    }
}
