//! RPC tracking across connection resets.
use std::cell::Cell;

use serde_json::json;

use flux_fabric::connector::loopback::LoopConnector;
use flux_fabric::connector::Connector;
use flux_fabric::dispatch::Match;
use flux_fabric::errno::Errno;
use flux_fabric::rpc::{rpc, RpcFlags};
use flux_fabric::{Cred, Handle, HandleFlags, Message, MessageType};

/// A loop transport that additionally supports reconnect.
struct Resettable {
    inner: LoopConnector,
    reconnects: Cell<u32>,
}

impl Connector for Resettable {
    fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno> {
        self.inner.send(msg, flags)
    }

    fn recv(&self, flags: HandleFlags) -> Result<Message, Errno> {
        self.inner.recv(flags)
    }

    fn pollfd(&self) -> Result<std::os::unix::io::RawFd, Errno> {
        self.inner.pollfd()
    }

    fn pollevents(&self) -> Result<flux_fabric::PollEvents, Errno> {
        self.inner.pollevents()
    }

    fn reconnect(&self) -> Result<(), Errno> {
        self.reconnects.set(self.reconnects.get() + 1);
        Ok(())
    }
}

fn open_tracked() -> Handle {
    Handle::create(
        Box::new(Resettable {
            inner: LoopConnector::new(),
            reconnects: Cell::new(0),
        }),
        HandleFlags::RPCTRACK,
    )
}

#[test]
fn test_reconnect_fails_inflight_rpcs() {
    let h = open_tracked();

    // Three RPCs in flight, none answered.
    let futures: Vec<_> = (0..3)
        .map(|i| {
            rpc(
                &h,
                "kvs.get",
                Some(&json!({ "key": format!("k{i}") })),
                RpcFlags::NONE,
            )
            .unwrap()
        })
        .collect();

    h.reconnect().unwrap();

    // Each orphaned request was answered with a synthesized ECONNRESET
    // response, delivered through the normal receive path.
    for f in &futures {
        assert_eq!(f.rpc_get().unwrap_err(), Errno::ECONNRESET);
        assert_eq!(
            f.error_string().as_deref(),
            Some("RPC aborted due to broker reconnect")
        );
    }
}

#[test]
fn test_synthesized_response_shape() {
    let h = open_tracked();
    let f = rpc(&h, "job.wait", None, RpcFlags::NONE).unwrap();

    h.reconnect().unwrap();

    // Pull the raw loop traffic: first the tracked request, then the
    // synthesized response.
    let req = h.recv(&Match::request(), HandleFlags::NONE).unwrap();
    assert_eq!(req.topic(), Some("job.wait"));

    let rep = h.recv(&Match::response(), HandleFlags::NONE).unwrap();
    assert_eq!(rep.mtype(), MessageType::Response);
    assert_eq!(rep.topic(), Some("job.wait"));
    assert_eq!(rep.matchtag(), req.matchtag());
    assert_eq!(rep.errnum(), Errno::ECONNRESET.raw());
    assert_eq!(rep.string(), Some("RPC aborted due to broker reconnect"));
    let cred = rep.cred().expect("synthesized response carries credentials");
    assert_eq!(cred.rolemask, Cred::ROLE_OWNER);

    drop(f);
}

#[test]
fn test_terminated_rpcs_not_failed() {
    let h = open_tracked();
    let r = h.reactor().unwrap();

    // One RPC answered before the reset, one left in flight.
    let answered = rpc(&h, "a.one", None, RpcFlags::NONE).unwrap();
    let orphaned = rpc(&h, "a.two", None, RpcFlags::NONE).unwrap();

    // Serve a.one by hand: pull the request, respond. Also pull a.two off
    // the transport so the dispatcher does not auto-answer it; it stays
    // tracked either way.
    let req = h
        .recv(&Match::request().topic("a.one"), HandleFlags::NONE)
        .unwrap();
    let _parked = h
        .recv(&Match::request().topic("a.two"), HandleFlags::NONE)
        .unwrap();
    h.respond(&req, Some(&json!({ "ok": true }))).unwrap();

    // Let the dispatcher deliver the response to the future.
    answered
        .then(None, |f| f.reactor().unwrap().stop())
        .unwrap();
    r.run(flux_fabric::reactor::RunFlags::Default).unwrap();
    assert!(answered.rpc_get().is_ok());

    h.reconnect().unwrap();

    assert_eq!(orphaned.rpc_get().unwrap_err(), Errno::ECONNRESET);
    // The answered RPC's result is untouched by the purge.
    assert!(answered.rpc_get().is_ok());
}

#[test]
fn test_reconnect_enosys_without_support() {
    let h = Handle::open(Some("loop://"), HandleFlags::NONE).unwrap();
    assert_eq!(h.reconnect().unwrap_err(), Errno::ENOSYS);
}
