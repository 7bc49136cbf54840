//! End-to-end handle traffic over the unix-domain connector.
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;

use serde_json::json;

use flux_fabric::rpc::{rpc, RpcFlags};
use flux_fabric::wire::{Decode, Encode};
use flux_fabric::{Handle, HandleFlags, Message};

/// Read whole frames from a stream, invoking `f` per decoded message;
/// returns on EOF.
fn read_frames(stream: &mut impl Read, mut f: impl FnMut(Message)) {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let Ok(n) = stream.read(&mut buf) else { return };
        if n == 0 {
            return;
        }
        pending.extend_from_slice(&buf[..n]);
        while pending.len() >= 4 {
            let len =
                u32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]) as usize;
            if pending.len() < 4 + len {
                break;
            }
            let body: Vec<u8> = pending.drain(..4 + len).skip(4).collect();
            let msg = Message::decode(&mut &body[..]).expect("well-formed frame");
            f(msg);
        }
    }
}

fn write_frame(stream: &mut impl Write, msg: &Message) {
    let body = msg.encode_to_vec();
    let mut frame = (body.len() as u32).to_be_bytes().to_vec();
    frame.extend_from_slice(&body);
    stream.write_all(&frame).expect("frame written");
}

/// A one-connection broker that serves the increment method.
fn spawn_broker(listener: UnixListener) {
    std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("client connected");
        let mut out = stream.try_clone().expect("stream clone");
        read_frames(&mut stream, |msg| {
            let counter = msg
                .unpack::<serde_json::Value>()
                .ok()
                .and_then(|v| v["counter"].as_i64());
            let rep = match counter {
                Some(n) => {
                    let mut rep = Message::response_derive(&msg, 0).unwrap();
                    rep.pack(&json!({ "counter": n + 1 })).unwrap();
                    rep
                }
                None => Message::response_derive(&msg, libc::EPROTO).unwrap(),
            };
            write_frame(&mut out, &rep);
        });
    });
}

#[test]
fn test_rpc_over_local_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&path).unwrap();
    spawn_broker(listener);

    let uri = format!("local://{}", path.display());
    let h = Handle::open(Some(&uri), HandleFlags::NONE).unwrap();

    let f = rpc(&h, "rpctest.incr", Some(&json!({ "counter": 41 })), RpcFlags::NONE).unwrap();
    let v: serde_json::Value = f.rpc_get_unpack().unwrap();
    assert_eq!(v["counter"], 42);
}

#[test]
fn test_rpc_error_over_local_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&path).unwrap();
    spawn_broker(listener);

    let uri = format!("local://{}", path.display());
    let h = Handle::open(Some(&uri), HandleFlags::NONE).unwrap();

    let f = rpc(&h, "rpctest.incr", Some(&json!({ "bogus": 1 })), RpcFlags::NONE).unwrap();
    assert_eq!(f.rpc_get().unwrap_err(), flux_fabric::Errno::EPROTO);
}

#[test]
fn test_uri_trailing_whitespace_trimmed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&path).unwrap();
    spawn_broker(listener);

    let uri = format!("local://{} \t", path.display());
    assert!(Handle::open(Some(&uri), HandleFlags::NONE).is_ok());
}
