//! Chained RPC composition against a live server thread.
mod common;

use std::cell::Cell;
use std::rc::Rc;

use serde_json::json;

use flux_fabric::errno::Errno;
use flux_fabric::future::Future;
use flux_fabric::reactor::RunFlags;
use flux_fabric::rpc::{rpc, RpcFlags};
use flux_fabric::Handle;

use common::{connect, shutdown, spawn_server};

fn incr(h: &Handle, n: i32) -> Future {
    rpc(
        h,
        "rpctest.incr",
        Some(&json!({ "counter": n })),
        RpcFlags::NONE,
    )
    .expect("send incr rpc")
}

fn incr_get(f: &Future) -> Result<i32, Errno> {
    #[derive(serde::Deserialize)]
    struct Body {
        counter: i32,
    }
    f.rpc_get_unpack::<Body>().map(|b| b.counter)
}

/// Continuation internal to the composite: feed the result of one incr into
/// the next.
fn incr_step(f: &Future) {
    let n = match incr_get(f) {
        Ok(n) => n,
        Err(e) => {
            f.continue_error(e, None);
            return;
        }
    };
    let h = f.handle().expect("context handle");
    let f_next = incr(&h, n);
    if let Err(e) = f.continue_with(&f_next) {
        f.continue_error(e, None);
    }
}

#[test]
fn test_sanity_now() {
    let t = spawn_server("chain-sanity-now");
    let h = connect("chain-sanity-now");

    let f = incr(&h, 0);
    assert_eq!(incr_get(&f), Ok(1));

    shutdown(&h, t);
}

#[test]
fn test_sanity_then() {
    let t = spawn_server("chain-sanity-then");
    let h = connect("chain-sanity-then");
    let r = h.reactor().unwrap();

    let f = incr(&h, 0);
    let count = Rc::new(Cell::new(0));
    f.then(None, {
        let count = count.clone();
        move |f| count.set(incr_get(f).expect("incr result"))
    })
    .unwrap();

    assert_eq!(r.run(RunFlags::Default).unwrap(), 0);
    assert_eq!(count.get(), 1);

    shutdown(&h, t);
}

#[test]
fn test_chained_now() {
    let t = spawn_server("chain-now");
    let h = connect("chain-now");

    // incr three times via a single blocking get on the composite.
    let f = incr(&h, 0).and_then(incr_step).and_then(incr_step);
    assert_eq!(incr_get(&f), Ok(3));

    shutdown(&h, t);
}

#[test]
fn test_chained_then() {
    let t = spawn_server("chain-then");
    let h = connect("chain-then");
    let r = h.reactor().unwrap();

    let f3 = incr(&h, 0).and_then(incr_step).and_then(incr_step);

    let count = Rc::new(Cell::new(0));
    let calls = Rc::new(Cell::new(0));
    f3.then(None, {
        let count = count.clone();
        let calls = calls.clone();
        move |f| {
            calls.set(calls.get() + 1);
            count.set(incr_get(f).expect("chained result"));
        }
    })
    .unwrap();

    assert_eq!(r.run(RunFlags::Default).unwrap(), 0);
    assert_eq!(calls.get(), 1, "continuation called once");
    assert_eq!(count.get(), 3);

    shutdown(&h, t);
}

#[test]
fn test_or_then_on_eproto() {
    let t = spawn_server("chain-eproto");
    let h = connect("chain-eproto");

    // Deliberately malformed payload: the service answers EPROTO.
    let bad = rpc(
        &h,
        "rpctest.incr",
        Some(&json!({ "not-counter": true })),
        RpcFlags::NONE,
    )
    .unwrap();

    let or_ran = Rc::new(Cell::new(false));
    let f = bad.or_then({
        let or_ran = or_ran.clone();
        move |f| {
            or_ran.set(true);
            assert!(incr_get(f).is_err());
            let e = f.error().expect("failed rpc has an error");
            assert_eq!(e, Errno::EPROTO);
            assert_eq!(f.error_string().as_deref(), Some("Protocol error"));
            f.continue_error(e, Some("Protocol error".into()));
        }
    });

    assert_eq!(f.get().unwrap_err(), Errno::EPROTO);
    assert!(or_ran.get());
    assert_eq!(f.error_string().as_deref(), Some("Protocol error"));

    shutdown(&h, t);
}
