//! Message endpoints.
//!
//! A [`Handle`] is the single entry point for sending and receiving
//! messages across any transport. It owns a [`Connector`], a re-queue deque
//! pulled ahead of the connector on receive, a matchtag pool, per-type
//! message counters, an optional comms-error hook, and an optional RPC
//! tracker that synthesizes failure responses when the connection resets.
//!
//! Handles are opened from URIs (`scheme://path`); clones share their
//! ancestor's connector and matchtag pool but carry their own reactor,
//! dispatcher and aux table.
use std::cell::{Cell, RefCell};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::aux::Aux;
use crate::connector::{
    dso::DsoConnector, interthread::InterthreadConnector, local::LocalConnector,
    loopback::LoopConnector, Connector, OptValue, OPT_INSTANCE_LEVEL, OPT_PARENT_URI,
    OPT_TESTING_ROLEMASK, OPT_TESTING_USERID,
};
use crate::deque::MessageDeque;
use crate::errno::Errno;
use crate::events::PollEvents;
use crate::message::{Cred, Message, MessageType};
use crate::reactor::Reactor;
use crate::tagpool::TagPool;
use crate::track::RpcTracker;
use crate::MATCHTAG_NONE;

/// Fallback endpoint when neither an argument nor `FLUX_URI` names one.
const DEFAULT_URI: &str = "local:///run/flux/local";

/// Handle open/runtime flags.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct HandleFlags(u32);

impl HandleFlags {
    pub const NONE: HandleFlags = HandleFlags(0);
    /// Dump message traffic to stderr.
    pub const TRACE: HandleFlags = HandleFlags(1);
    /// The handle delegates to a parent's connector.
    pub const CLONE: HandleFlags = HandleFlags(2);
    /// Sends and receives fail rather than block.
    pub const NONBLOCK: HandleFlags = HandleFlags(4);
    /// Diagnose matchtag leaks and double frees on stderr.
    pub const MATCHDEBUG: HandleFlags = HandleFlags(8);
    /// Test-only suppression of event subscription.
    pub const NOSUB: HandleFlags = HandleFlags(16);
    /// Track in-flight RPCs and fail them on reconnect (open-time only).
    pub const RPCTRACK: HandleFlags = HandleFlags(32);
    /// Disable the re-queue deque; unmatched receives are discarded.
    pub const NOREQUEUE: HandleFlags = HandleFlags(64);

    const ALL: HandleFlags = HandleFlags(127);
    /// Flags mutable after open.
    const RUNTIME: HandleFlags =
        HandleFlags(Self::TRACE.0 | Self::CLONE.0 | Self::NONBLOCK.0 | Self::MATCHDEBUG.0 | Self::NOSUB.0);

    pub fn contains(&self, other: HandleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    fn validate(&self, allowed: HandleFlags) -> Result<(), Errno> {
        if self.0 & !allowed.0 != 0 {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }
}

impl std::ops::BitOr for HandleFlags {
    type Output = HandleFlags;

    fn bitor(self, rhs: HandleFlags) -> HandleFlags {
        HandleFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for HandleFlags {
    fn bitor_assign(&mut self, rhs: HandleFlags) {
        self.0 |= rhs.0;
    }
}

/// Failure to open a handle, with user-visible detail.
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct OpenError {
    errno: Errno,
    message: String,
}

impl OpenError {
    fn new(errno: Errno, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: message.into(),
        }
    }

    pub fn errno(&self) -> Errno {
        self.errno
    }
}

impl From<Errno> for OpenError {
    fn from(errno: Errno) -> Self {
        Self::new(errno, errno.strerror())
    }
}

/// Per-type transmit/receive counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct MsgCounters {
    pub request_tx: u64,
    pub request_rx: u64,
    pub response_tx: u64,
    pub response_rx: u64,
    pub event_tx: u64,
    pub event_rx: u64,
    pub control_tx: u64,
    pub control_rx: u64,
}

/// Where [`Handle::requeue`] inserts.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Requeue {
    Front,
    Tail,
}

type CommsErrorFn = Box<dyn FnMut(&Handle, Errno) -> bool>;

pub(crate) struct HandleInner {
    parent: Option<Handle>,
    flags: Cell<HandleFlags>,
    aux: RefCell<Aux>,
    reactor: RefCell<Option<Reactor>>,
    pub(crate) dispatch: RefCell<Option<Rc<crate::dispatch::Dispatcher>>>,

    // Fields below are unused in clones; every operation resolves to the
    // clone ancestor first.
    connector: Option<Box<dyn Connector>>,
    queue: Option<MessageDeque>,
    pollfd: RefCell<Option<mio::Poll>>,
    tagpool: RefCell<TagPool>,
    counters: RefCell<MsgCounters>,
    comms_error: RefCell<Option<CommsErrorFn>>,
    comms_error_in_progress: Cell<bool>,
    destroy_in_progress: Cell<bool>,
    tracker: Option<RefCell<RpcTracker>>,
    trace_start: Cell<Option<Instant>>,
}

/// A polymorphic message endpoint. Cloning the value is reference counting;
/// see [`Handle::clone_handle`] for protocol-level clones.
#[derive(Clone)]
pub struct Handle {
    inner: Rc<HandleInner>,
}

/// Non-owning reference to a handle, for callbacks that must not keep it
/// alive.
#[derive(Clone)]
pub struct WeakHandle {
    inner: std::rc::Weak<HandleInner>,
}

impl WeakHandle {
    pub fn upgrade(&self) -> Option<Handle> {
        self.inner.upgrade().map(|inner| Handle { inner })
    }
}

impl Handle {
    /// Open a handle by URI.
    ///
    /// With `uri = None` the endpoint comes from `FLUX_URI` or a builtin
    /// default. A URI starting with `.` or `/` is resolved as a
    /// hierarchical instance path before scheme lookup. The scheme is
    /// looked up among the builtin connectors (`loop`, `interthread`,
    /// `local`), then on the DSO search path.
    pub fn open(uri: Option<&str>, mut flags: HandleFlags) -> Result<Handle, OpenError> {
        flags
            .validate(HandleFlags::ALL)
            .map_err(|e| OpenError::new(e, "invalid flags specified"))?;

        let uri = match uri {
            None => get_local_uri(),
            Some(u) if u.starts_with('.') || u.starts_with('/') => resolve_path_uri(u)?,
            Some(u) => u.to_owned(),
        };
        let (scheme, path) = split_uri(&uri)?;

        if std::env::var_os("FLUX_HANDLE_TRACE").is_some() {
            flags |= HandleFlags::TRACE;
        }
        if std::env::var_os("FLUX_HANDLE_MATCHDEBUG").is_some() {
            flags |= HandleFlags::MATCHDEBUG;
        }

        let connector: Box<dyn Connector> = match scheme {
            "loop" => Box::new(LoopConnector::new()),
            "interthread" => Box::new(InterthreadConnector::open(path).map_err(|e| {
                OpenError::new(e, format!("interthread://{path}: {}", e.strerror()))
            })?),
            "local" => Box::new(
                LocalConnector::open(path)
                    .map_err(|e| OpenError::new(e, format!("local://{path}: {}", e.strerror())))?,
            ),
            other => Box::new(
                DsoConnector::load(other, path, flags)
                    .map_err(|e| OpenError::new(e.errno(), e.to_string()))?,
            ),
        };
        let h = Handle::create(connector, flags);

        if let Ok(s) = std::env::var("FLUX_HANDLE_USERID") {
            let userid: u32 = s.parse().map_err(|_| {
                OpenError::new(Errno::EINVAL, format!("FLUX_HANDLE_USERID: bad value '{s}'"))
            })?;
            h.setopt(OPT_TESTING_USERID, OptValue::U32(userid))?;
        }
        if let Ok(s) = std::env::var("FLUX_HANDLE_ROLEMASK") {
            let rolemask = parse_u32_maybe_hex(&s).ok_or_else(|| {
                OpenError::new(
                    Errno::EINVAL,
                    format!("FLUX_HANDLE_ROLEMASK: bad value '{s}'"),
                )
            })?;
            h.setopt(OPT_TESTING_ROLEMASK, OptValue::U32(rolemask))?;
        }
        Ok(h)
    }

    /// Wrap a connector in a handle. Public so out-of-tree connectors can
    /// be used without going through URI resolution.
    pub fn create(connector: Box<dyn Connector>, flags: HandleFlags) -> Handle {
        let queue = if flags.contains(HandleFlags::NOREQUEUE) {
            None
        } else {
            Some(MessageDeque::new())
        };
        let tracker = if flags.contains(HandleFlags::RPCTRACK) {
            Some(RefCell::new(RpcTracker::new()))
        } else {
            None
        };
        Handle {
            inner: Rc::new(HandleInner {
                parent: None,
                flags: Cell::new(flags),
                aux: RefCell::new(Aux::new()),
                reactor: RefCell::new(None),
                dispatch: RefCell::new(None),
                connector: Some(connector),
                queue,
                pollfd: RefCell::new(None),
                tagpool: RefCell::new(TagPool::new()),
                counters: RefCell::new(MsgCounters::default()),
                comms_error: RefCell::new(None),
                comms_error_in_progress: Cell::new(false),
                destroy_in_progress: Cell::new(false),
                tracker,
                trace_start: Cell::new(None),
            }),
        }
    }

    /// Create a protocol-level clone: same connector and matchtag pool,
    /// fresh reactor, dispatcher and aux table.
    pub fn clone_handle(&self) -> Handle {
        Handle {
            inner: Rc::new(HandleInner {
                parent: Some(self.clone()),
                flags: Cell::new(self.flags() | HandleFlags::CLONE),
                aux: RefCell::new(Aux::new()),
                reactor: RefCell::new(None),
                dispatch: RefCell::new(None),
                connector: None,
                queue: None,
                pollfd: RefCell::new(None),
                tagpool: RefCell::new(TagPool::new()),
                counters: RefCell::new(MsgCounters::default()),
                comms_error: RefCell::new(None),
                comms_error_in_progress: Cell::new(false),
                destroy_in_progress: Cell::new(false),
                tracker: None,
                trace_start: Cell::new(None),
            }),
        }
    }

    pub(crate) fn dispatch_slot(&self) -> &RefCell<Option<Rc<crate::dispatch::Dispatcher>>> {
        &self.inner.dispatch
    }

    /// A non-owning reference to this handle.
    pub fn downgrade(&self) -> WeakHandle {
        WeakHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Resolve through any chain of clones to the handle owning the
    /// connector.
    pub(crate) fn ancestor(&self) -> Handle {
        let mut h = self.clone();
        while h.inner.flags.get().contains(HandleFlags::CLONE) {
            let parent = h.inner.parent.clone().expect("clone has a parent");
            h = parent;
        }
        h
    }

    /// True if two handles resolve to the same connector.
    pub fn same_family(&self, other: &Handle) -> bool {
        Rc::ptr_eq(&self.ancestor().inner, &other.ancestor().inner)
    }

    fn connector(&self) -> &dyn Connector {
        self.inner
            .connector
            .as_deref()
            .expect("ancestor owns a connector")
    }

    pub fn flags(&self) -> HandleFlags {
        self.inner.flags.get()
    }

    /// Set runtime-mutable flags; `RPCTRACK` and `NOREQUEUE` are open-time
    /// only and are ignored here.
    pub fn flags_set(&self, flags: HandleFlags) {
        let cur = self.inner.flags.get();
        self.inner
            .flags
            .set(HandleFlags(cur.0 | (flags.0 & HandleFlags::RUNTIME.0)));
    }

    pub fn flags_unset(&self, flags: HandleFlags) {
        let cur = self.inner.flags.get();
        self.inner.flags.set(HandleFlags(cur.0 & !flags.0));
    }

    /// The reactor associated with this handle, created on first use.
    pub fn reactor(&self) -> Result<Reactor, Errno> {
        let mut slot = self.inner.reactor.borrow_mut();
        if slot.is_none() {
            *slot = Some(Reactor::new()?);
        }
        Ok(slot.as_ref().expect("just set").clone())
    }

    /// Associate a reactor; fails with `EEXIST` if one is already set.
    pub fn set_reactor(&self, reactor: &Reactor) -> Result<(), Errno> {
        let mut slot = self.inner.reactor.borrow_mut();
        if slot.is_some() {
            return Err(Errno::EEXIST);
        }
        *slot = Some(reactor.clone());
        Ok(())
    }

    /// Store an aux value on this handle (clones have their own table).
    pub fn aux_set<T: std::any::Any>(&self, key: &str, val: T) {
        self.inner.aux.borrow_mut().set(key, val);
    }

    /// Fetch an aux value, cloning out (values are typically `Rc`s).
    pub fn aux_get<T: std::any::Any + Clone>(&self, key: &str) -> Result<T, Errno> {
        self.inner.aux.borrow().get::<T>(key).cloned()
    }

    /// Register the comms-error hook. Returning `true` converts the error
    /// into a retry of the failed operation.
    pub fn comms_error_set(&self, f: impl FnMut(&Handle, Errno) -> bool + 'static) {
        let h = self.ancestor();
        *h.inner.comms_error.borrow_mut() = Some(Box::new(f));
    }

    fn comms_error(&self, errno: Errno) -> bool {
        let h = self.ancestor();
        if h.inner.comms_error_in_progress.get() {
            return false;
        }
        let mut cb = h.inner.comms_error.borrow_mut().take();
        let retry = match cb.as_mut() {
            Some(f) => {
                h.inner.comms_error_in_progress.set(true);
                let r = f(&h, errno);
                h.inner.comms_error_in_progress.set(false);
                r
            }
            None => false,
        };
        // Reinstall unless the callback replaced itself.
        if let Some(f) = cb {
            let mut slot = h.inner.comms_error.borrow_mut();
            if slot.is_none() {
                *slot = Some(f);
            }
        }
        retry
    }

    fn update_tx_stats(&self, msg: &Message) {
        let mut c = self.inner.counters.borrow_mut();
        match msg.mtype() {
            MessageType::Request => c.request_tx += 1,
            MessageType::Response => c.response_tx += 1,
            MessageType::Event => c.event_tx += 1,
            MessageType::Control => c.control_tx += 1,
        }
    }

    fn update_rx_stats(&self, msg: &Message) {
        let mut c = self.inner.counters.borrow_mut();
        match msg.mtype() {
            MessageType::Request => c.request_rx += 1,
            MessageType::Response => c.response_rx += 1,
            MessageType::Event => c.event_rx += 1,
            MessageType::Control => c.control_rx += 1,
        }
    }

    pub fn message_counts(&self) -> MsgCounters {
        *self.ancestor().inner.counters.borrow()
    }

    pub fn clear_message_counts(&self) {
        *self.ancestor().inner.counters.borrow_mut() = MsgCounters::default();
    }

    fn trace_timestamp(&self) -> f64 {
        let start = match self.inner.trace_start.get() {
            Some(t) => t,
            None => {
                let now = Instant::now();
                self.inner.trace_start.set(Some(now));
                now
            }
        };
        start.elapsed().as_secs_f64()
    }

    fn trace_message(&self, msg: &Message) {
        if self.flags().contains(HandleFlags::TRACE) {
            eprintln!("--------------------------------------");
            eprintln!("c {:.5}", self.trace_timestamp());
            eprintln!("{}", msg.dump());
        }
    }

    pub(crate) fn trace(&self, text: &str) {
        if self.flags().contains(HandleFlags::TRACE) {
            eprintln!("--------------------------------------");
            eprintln!("c {:.5}", self.trace_timestamp());
            eprintln!("c {text}");
        }
    }

    /// Send a message, retrying while the comms-error hook recovers
    /// transient transport failures.
    pub fn send(&self, msg: &Message, flags: HandleFlags) -> Result<(), Errno> {
        flags.validate(HandleFlags::NONBLOCK)?;
        let h = self.ancestor();
        if h.inner.destroy_in_progress.get() {
            return Err(Errno::ENOSYS);
        }
        let flags = flags | h.flags();
        h.update_tx_stats(msg);
        h.trace_message(msg);
        loop {
            match h.connector().send(msg, flags) {
                Ok(()) => break,
                Err(e) => {
                    if !h.comms_error(e) {
                        return Err(e);
                    }
                }
            }
        }
        if let Some(tracker) = &h.inner.tracker {
            tracker.borrow_mut().update(msg);
        }
        Ok(())
    }

    /// Send a message, transferring ownership. Without an RPC tracker the
    /// connector may take a copy-free path.
    pub fn send_new(&self, msg: Message, flags: HandleFlags) -> Result<(), Errno> {
        flags.validate(HandleFlags::NONBLOCK)?;
        let h = self.ancestor();
        // Tracking needs to retain the message, so fall back to the
        // copying path.
        if h.inner.tracker.is_some() {
            return h.send(&msg, flags);
        }
        if h.inner.destroy_in_progress.get() {
            return Err(Errno::ENOSYS);
        }
        let flags = flags | h.flags();
        h.update_tx_stats(&msg);
        h.trace_message(&msg);
        let mut msg = msg;
        loop {
            match h.connector().send_new(msg, flags) {
                Ok(()) => return Ok(()),
                Err((back, e)) => {
                    if !h.comms_error(e) {
                        return Err(e);
                    }
                    msg = back;
                }
            }
        }
    }

    fn recv_any(&self, flags: HandleFlags) -> Result<Message, Errno> {
        // Requeued messages take priority over the connector.
        if let Some(queue) = &self.inner.queue {
            if let Some(msg) = queue.pop_front() {
                return Ok(msg);
            }
        }
        loop {
            match self.connector().recv(flags) {
                Ok(msg) => return Ok(msg),
                Err(e) if e.is_would_block() => return Err(e),
                Err(e) => {
                    if !self.comms_error(e) {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Receive the next message satisfying `match_`. Non-matching messages
    /// read along the way are requeued on return, preserving order. Under
    /// `NOREQUEUE` they are discarded instead.
    pub fn recv(&self, match_: &crate::dispatch::Match, flags: HandleFlags) -> Result<Message, Errno> {
        flags.validate(HandleFlags::NONBLOCK)?;
        let h = self.ancestor();
        let flags = flags | h.flags();
        let mut deferred: Vec<Message> = Vec::new();

        let result = loop {
            match h.recv_any(flags) {
                Err(e) if e.is_would_block() => {
                    break Err(Errno::EWOULDBLOCK);
                }
                Err(e) => break Err(e),
                Ok(msg) => {
                    if match_.matches(&msg) {
                        break Ok(msg);
                    }
                    deferred.push(msg);
                }
            }
        };
        for msg in deferred {
            if !h.flags().contains(HandleFlags::NOREQUEUE) {
                h.requeue_owned(msg, Requeue::Tail);
            }
        }
        let msg = result?;
        h.update_rx_stats(&msg);
        h.trace_message(&msg);
        if let Some(tracker) = &h.inner.tracker {
            tracker.borrow_mut().update(&msg);
        }
        Ok(msg)
    }

    /// Reinsert a message so a subsequent receive sees it.
    pub fn requeue(&self, msg: &Message, place: Requeue) -> Result<(), Errno> {
        let h = self.ancestor();
        if h.flags().contains(HandleFlags::NOREQUEUE) {
            return Err(Errno::EINVAL);
        }
        h.requeue_owned(msg.clone(), place);
        Ok(())
    }

    pub(crate) fn requeue_owned(&self, msg: Message, place: Requeue) {
        let h = self.ancestor();
        let Some(queue) = &h.inner.queue else { return };
        match place {
            Requeue::Front => queue.push_front(msg),
            Requeue::Tail => queue.push_back(msg),
        }
    }

    /// Allocate a matchtag, expanding the pool on demand.
    pub fn matchtag_alloc(&self) -> u32 {
        let h = self.ancestor();
        let tag = h.inner.tagpool.borrow_mut().alloc();
        tag
    }

    /// Release a matchtag. Double frees and invalid frees are diagnosed on
    /// stderr under `MATCHDEBUG`, but never fatal.
    pub fn matchtag_free(&self, matchtag: u32) {
        let h = self.ancestor();
        let debug = h.flags().contains(HandleFlags::MATCHDEBUG);
        if matchtag == MATCHTAG_NONE {
            if debug {
                eprintln!("MATCHDEBUG: invalid tag={matchtag}");
            }
            return;
        }
        let result = h.inner.tagpool.borrow_mut().free(matchtag);
        match result {
            Ok(()) => {}
            Err(Errno::EEXIST) if debug => eprintln!("MATCHDEBUG: double free tag={matchtag}"),
            Err(_) if debug => eprintln!("MATCHDEBUG: invalid tag={matchtag}"),
            Err(_) => {}
        }
    }

    /// Number of matchtags available without pool expansion.
    pub fn matchtag_avail(&self) -> u32 {
        self.ancestor().inner.tagpool.borrow().avail()
    }

    /// Set a connector option.
    pub fn setopt(&self, option: &str, value: OptValue) -> Result<(), Errno> {
        self.ancestor().connector().setopt(option, value)
    }

    /// Get a connector option.
    pub fn getopt(&self, option: &str) -> Result<OptValue, Errno> {
        self.ancestor().connector().getopt(option)
    }

    /// Reestablish the transport, failing all tracked RPCs with
    /// `ECONNRESET` responses requeued on the receive side.
    pub fn reconnect(&self) -> Result<(), Errno> {
        let h = self.ancestor();

        // Drop the stale connector fd from the aggregate pollfd before the
        // transport replaces it.
        if let Some(poll) = &*h.inner.pollfd.borrow() {
            if let Ok(fd) = h.connector().pollfd() {
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
        }
        h.trace("trying to reconnect");
        if let Err(e) = h.connector().reconnect() {
            h.trace("reconnect failed");
            return Err(e);
        }
        if let Some(poll) = &*h.inner.pollfd.borrow() {
            let fd = h.connector().pollfd()?;
            poll.registry()
                .register(
                    &mut SourceFd(&fd),
                    Token(1),
                    Interest::READABLE | Interest::WRITABLE,
                )
                .map_err(Errno::from)?;
        }
        h.trace("reconnected");

        if let Some(tracker) = &h.inner.tracker {
            let mut purged = Vec::new();
            tracker.borrow_mut().purge(|req| purged.push(req.clone()));
            for req in purged {
                h.fail_tracked_request(&req);
            }
        }
        Ok(())
    }

    /// Synthesize an `ECONNRESET` response for an orphaned request and
    /// requeue it so user continuations fire normally.
    fn fail_tracked_request(&self, req: &Message) {
        let topic = req.topic().unwrap_or("NULL").to_owned();
        match Message::response_derive(req, Errno::ECONNRESET.raw()) {
            Ok(mut rep) => {
                rep.set_string("RPC aborted due to broker reconnect");
                rep.set_cred(Cred {
                    userid: 0,
                    rolemask: Cred::ROLE_OWNER,
                });
                self.requeue_owned(rep, Requeue::Tail);
                self.trace(&format!("responded to tracked rpc topic={topic}"));
            }
            Err(e) => {
                self.trace(&format!(
                    "error responding to tracked rpc topic={topic}: {e}"
                ));
            }
        }
    }

    /// The aggregate poll descriptor: readable (edge-triggered) when the
    /// connector or the re-queue deque may have become ready.
    pub fn pollfd(&self) -> Result<RawFd, Errno> {
        let h = self.ancestor();
        let mut slot = h.inner.pollfd.borrow_mut();
        if slot.is_none() {
            let poll = mio::Poll::new().map_err(Errno::from)?;
            if let Some(queue) = &h.inner.queue {
                let fd = queue.pollfd()?;
                poll.registry()
                    .register(
                        &mut SourceFd(&fd),
                        Token(0),
                        Interest::READABLE | Interest::WRITABLE,
                    )
                    .map_err(Errno::from)?;
            }
            if let Ok(fd) = h.connector().pollfd() {
                poll.registry()
                    .register(
                        &mut SourceFd(&fd),
                        Token(1),
                        Interest::READABLE | Interest::WRITABLE,
                    )
                    .map_err(Errno::from)?;
            }
            *slot = Some(poll);
        }
        Ok(slot.as_ref().expect("just set").as_raw_fd())
    }

    /// Sample handle readiness: connector events OR'd with re-queue deque
    /// events. A connector error is first offered to the comms-error hook
    /// and suppressed if it recovers.
    pub fn pollevents(&self) -> Result<PollEvents, Errno> {
        let h = self.ancestor();
        // Clear the aggregate edge.
        if let Some(poll) = &mut *h.inner.pollfd.borrow_mut() {
            let mut events = mio::Events::with_capacity(2);
            let _ = poll.poll(&mut events, Some(std::time::Duration::ZERO));
        }
        let mut events = match h.connector().pollevents() {
            Ok(e) => e,
            Err(Errno::ENOSYS) => PollEvents::NONE,
            Err(e) => return Err(e),
        };
        if events.contains(PollEvents::ERR) && h.comms_error(Errno::ECONNRESET) {
            events.remove(PollEvents::ERR);
        }
        if let Some(queue) = &h.inner.queue {
            events |= queue.pollevents();
        }
        Ok(events)
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.destroy_in_progress.set(true);
        if self.parent.is_none() && self.flags.get().contains(HandleFlags::MATCHDEBUG) {
            let allocated = self.tagpool.borrow().allocated();
            if allocated > 0 {
                eprintln!("MATCHDEBUG: pool destroy with {allocated} allocated");
            }
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("flags", &self.flags().raw())
            .field("clone", &self.inner.parent.is_some())
            .finish()
    }
}

fn get_local_uri() -> String {
    std::env::var("FLUX_URI").unwrap_or_else(|_| DEFAULT_URI.to_owned())
}

fn parse_u32_maybe_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Split `scheme://path`, trimming trailing whitespace from the path.
fn split_uri(uri: &str) -> Result<(&str, &str), OpenError> {
    match uri.split_once("://") {
        Some((scheme, path)) => Ok((scheme, path.trim_end_matches([' ', '\t']))),
        None => Ok((uri, "")),
    }
}

/// Count `..` elements in a slash-separated path; `.` elements are ignored
/// and anything else is an error.
fn count_parents(path: &str) -> Result<usize, OpenError> {
    let mut n = 0;
    for elem in path.split('/').filter(|e| !e.is_empty()) {
        match elem {
            ".." => n += 1,
            "." => {}
            other => {
                return Err(OpenError::new(
                    Errno::EINVAL,
                    format!("{path}: invalid URI path element '{other}'"),
                ))
            }
        }
    }
    Ok(n)
}

/// Resolve a path-like URI (`.`, `..`, `/`) to an ancestor instance URI.
fn resolve_path_uri(path: &str) -> Result<String, OpenError> {
    let nparents: i64 = if path.starts_with('/') {
        // A leading slash means "the root instance" and must stand alone.
        if path != "/" {
            return Err(OpenError::new(Errno::EINVAL, format!("{path}: invalid URI")));
        }
        -1
    } else {
        count_parents(path)? as i64
    };

    // Always start from the current enclosing instance.
    let h = Handle::open(None, HandleFlags::NONE)?;
    resolve_ancestor_uri(h, nparents)
}

/// Walk `parent-uri` attributes until the requested depth is reached. If
/// `n < 0` or `n` exceeds the instance level, resolve to the root.
fn resolve_ancestor_uri(mut h: Handle, n: i64) -> Result<String, OpenError> {
    let mut level: i64 = h
        .getopt(OPT_INSTANCE_LEVEL)
        .and_then(|v| v.as_u32())
        .map(i64::from)
        .map_err(|e| {
            OpenError::new(e, format!("Failed to get instance-level attribute: {e}"))
        })?;

    if n == 0 || level == 0 {
        return Ok(get_local_uri());
    }
    let depth = if n > 0 { (level - n).max(0) } else { 0 };

    loop {
        let uri = h
            .getopt(OPT_PARENT_URI)
            .and_then(|v| v.as_str().map(str::to_owned))
            .map_err(OpenError::from)?;
        level -= 1;
        if level == depth {
            return Ok(uri);
        }
        h = Handle::open(Some(&uri), HandleFlags::NONE)?;
    }
}
