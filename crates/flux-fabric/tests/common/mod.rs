//! Shared test plumbing: an in-process server in the manner of a
//! broker-side module, reachable over the interthread connector.
use std::thread::JoinHandle;

use serde_json::json;
use flux_fabric::dispatch::{Match, MessageHandler};
use flux_fabric::reactor::RunFlags;
use flux_fabric::rpc::{rpc, RpcFlags};
use flux_fabric::{Handle, HandleFlags, Message};

/// Register the increment service: unpacks `{counter: n}`, responds
/// `{counter: n + 1}`; malformed payloads get the unpack error back.
pub fn register_incr(h: &Handle) -> MessageHandler {
    let mh = MessageHandler::new(h, Match::request().topic("rpctest.incr"), {
        |h: &Handle, _: &MessageHandler, msg: &Message| {
            #[derive(serde::Deserialize)]
            struct Body {
                counter: i32,
            }
            match msg.unpack::<Body>() {
                Ok(body) => h
                    .respond(msg, Some(&json!({ "counter": body.counter + 1 })))
                    .expect("respond"),
                Err(e) => h.respond_error(msg, e, None).expect("respond_error"),
            }
        }
    })
    .expect("register rpctest.incr");
    mh.start();
    mh
}

/// Start a server thread running the increment service on
/// `interthread://{name}`, returning once it accepts requests.
pub fn spawn_server(name: &'static str) -> JoinHandle<()> {
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let t = std::thread::spawn(move || {
        let h = Handle::open(Some(&format!("interthread://{name}")), HandleFlags::NONE)
            .expect("open server endpoint");
        let r = h.reactor().expect("server reactor");
        let _incr = register_incr(&h);
        let stop = MessageHandler::new(&h, Match::request().topic("test.shutdown"), {
            let r = r.clone();
            move |_: &Handle, _: &MessageHandler, _: &Message| r.stop()
        })
        .expect("register test.shutdown");
        stop.start();

        ready_tx.send(()).expect("signal readiness");
        r.run(RunFlags::Default).expect("server loop");
    });
    ready_rx.recv().expect("server came up");
    t
}

pub fn connect(name: &str) -> Handle {
    Handle::open(Some(&format!("interthread://{name}")), HandleFlags::NONE)
        .expect("open client endpoint")
}

pub fn shutdown(h: &Handle, t: JoinHandle<()>) {
    rpc(h, "test.shutdown", None, RpcFlags::NORESPONSE).expect("send shutdown");
    t.join().expect("server exited");
}
