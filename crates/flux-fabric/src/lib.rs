//! Message fabric runtime.
//!
//! This crate is the in-process machinery that brokers, modules and client
//! libraries use to send, route and react to typed messages:
//!
//! * [`Handle`], a polymorphic message endpoint with pluggable
//!   [`Connector`] transports, message queueing, matchtag allocation and
//!   connection-reset recovery.
//! * [`Reactor`] and [`Watcher`], a single-threaded cooperative event loop
//!   with uniform lifecycle semantics across file descriptors, timers,
//!   signals, sockets and message handles.
//! * [`Future`], asynchronous result values supporting blocking wait,
//!   continuations, chaining and multi-fulfillment, with automatic failure
//!   of in-flight requests when a peer disconnects ([`track`]).
//!
//! [`Connector`]: connector::Connector

pub mod aux;
pub mod connector;
pub mod deque;
pub mod dispatch;
pub mod errno;
pub mod events;
pub mod future;
pub mod handle;
pub mod message;
pub mod plugin;
pub mod reactor;
pub mod rpc;
pub mod stdlog;
pub mod tagpool;
pub mod track;
pub mod watcher;
pub mod wire;

pub use aux::Aux;
pub use deque::MessageDeque;
pub use dispatch::{Match, MessageHandler};
pub use errno::Errno;
pub use events::PollEvents;
pub use future::Future;
pub use handle::{Handle, HandleFlags, OpenError};
pub use message::{Cred, Message, MessageType, MsgFlags};
pub use reactor::Reactor;
pub use rpc::{rpc, RpcFlags};
pub use watcher::Watcher;

/// The matchtag value meaning "none"; never allocated.
pub const MATCHTAG_NONE: u32 = 0;
