//! Message-to-handler matching.
//!
//! Handlers are registered against a [`Match`] (type mask, topic glob,
//! matchtag) and driven by a handle watcher that delivers at most one
//! message per reactor iteration, so a busy handle cannot starve other
//! watchers.
//!
//! Matching precedence per message type:
//!
//! * **responses** with a matchtag and an empty route stack take a fast
//!   path keyed by matchtag; responses carrying routes (a foreign matchtag
//!   domain) fall through to glob handlers;
//! * **requests** match exact-topic handlers before glob handlers; among
//!   exact handlers the last registered wins, and removing it restores the
//!   previous binding (method override);
//! * **events and control** messages are delivered to every matching
//!   handler.
//!
//! Unhandled requests are answered with an `ENOSYS` response unless the
//! sender asked for no response.
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::{Handle, HandleFlags, Requeue, WeakHandle};
use crate::message::{Message, MessageType};
use crate::watcher::Watcher;
use crate::MATCHTAG_NONE;

/// Which messages a handler or receive call accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    typemask: u8,
    topic_glob: Option<String>,
    matchtag: u32,
}

impl Match {
    const ANY_TYPE: u8 = 0x0f;

    /// Match everything.
    pub fn any() -> Self {
        Self {
            typemask: Self::ANY_TYPE,
            topic_glob: None,
            matchtag: MATCHTAG_NONE,
        }
    }

    pub fn request() -> Self {
        Self {
            typemask: MessageType::Request as u8,
            ..Self::any()
        }
    }

    pub fn response() -> Self {
        Self {
            typemask: MessageType::Response as u8,
            ..Self::any()
        }
    }

    pub fn event() -> Self {
        Self {
            typemask: MessageType::Event as u8,
            ..Self::any()
        }
    }

    pub fn control() -> Self {
        Self {
            typemask: MessageType::Control as u8,
            ..Self::any()
        }
    }

    /// Restrict to a topic glob (`*`, `?`, `[...]` wildcards).
    pub fn topic(mut self, glob: impl Into<String>) -> Self {
        self.topic_glob = Some(glob.into());
        self
    }

    /// Restrict to a matchtag.
    pub fn matchtag(mut self, matchtag: u32) -> Self {
        self.matchtag = matchtag;
        self
    }

    /// True when the topic pattern contains no wildcard characters.
    fn is_exact_topic(&self) -> bool {
        self.topic_glob
            .as_deref()
            .map(|g| !g.contains(['*', '?', '[']))
            .unwrap_or(false)
    }

    /// Test a message against this match.
    pub fn matches(&self, msg: &Message) -> bool {
        if self.typemask & msg.mtype() as u8 == 0 {
            return false;
        }
        if self.matchtag != MATCHTAG_NONE && self.matchtag != msg.matchtag() {
            return false;
        }
        if let Some(glob) = &self.topic_glob {
            let Some(topic) = msg.topic() else {
                return false;
            };
            if !fast_glob::glob_match(glob, topic) {
                return false;
            }
        }
        true
    }
}

type HandlerFn = Box<dyn FnMut(&Handle, &MessageHandler, &Message)>;

struct HandlerState {
    dispatcher: Weak<Dispatcher>,
    match_: Match,
    cb: RefCell<Option<HandlerFn>>,
    started: Cell<bool>,
    /// Registration order; later wins for method override.
    seq: u64,
}

/// A registered message handler. Dropping the last reference removes it
/// from the dispatcher.
#[derive(Clone)]
pub struct MessageHandler {
    state: Rc<HandlerState>,
}

impl MessageHandler {
    /// Register a handler on `handle`'s dispatcher. The handler is created
    /// stopped.
    pub fn new(
        handle: &Handle,
        match_: Match,
        cb: impl FnMut(&Handle, &MessageHandler, &Message) + 'static,
    ) -> Result<MessageHandler, Errno> {
        let dispatcher = Dispatcher::get(handle)?;
        let state = Rc::new(HandlerState {
            dispatcher: Rc::downgrade(&dispatcher),
            match_,
            cb: RefCell::new(Some(Box::new(cb))),
            started: Cell::new(false),
            seq: dispatcher.next_seq(),
        });
        dispatcher.handlers.borrow_mut().push(state.clone());
        Ok(MessageHandler { state })
    }

    /// Begin receiving messages.
    pub fn start(&self) {
        if self.state.started.replace(true) {
            return;
        }
        if let Some(d) = self.state.dispatcher.upgrade() {
            d.handler_started(&self.state);
        }
    }

    /// Stop receiving messages; `start` re-arms.
    pub fn stop(&self) {
        if !self.state.started.replace(false) {
            return;
        }
        if let Some(d) = self.state.dispatcher.upgrade() {
            d.handler_stopped(&self.state);
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.started.get()
    }
}

impl Drop for MessageHandler {
    fn drop(&mut self) {
        // Two refs remain at the last user drop: ours and the dispatcher's
        // registration.
        if Rc::strong_count(&self.state) > 2 {
            return;
        }
        self.stop();
        if let Some(d) = self.state.dispatcher.upgrade() {
            d.handlers
                .borrow_mut()
                .retain(|h| !Rc::ptr_eq(h, &self.state));
        }
    }
}

pub(crate) struct Dispatcher {
    handle: WeakHandle,
    watcher: RefCell<Option<Watcher>>,
    handlers: RefCell<Vec<Rc<HandlerState>>>,
    /// Matchtag fast path for local responses.
    fastpath: RefCell<HashMap<u32, Rc<HandlerState>>>,
    /// Messages this dispatcher could not deliver (clones only); returned
    /// to the ancestor via [`Handle::dispatch_requeue`].
    unmatched: RefCell<Vec<Message>>,
    started_count: Cell<usize>,
    seq: Cell<u64>,
}

impl Dispatcher {
    /// The dispatcher bound to `handle`, created on first use along with
    /// its handle watcher.
    pub(crate) fn get(handle: &Handle) -> Result<Rc<Dispatcher>, Errno> {
        if let Some(d) = &*handle.dispatch_slot().borrow() {
            return Ok(d.clone());
        }
        let reactor = handle.reactor()?;
        let dispatcher = Rc::new(Dispatcher {
            handle: handle.downgrade(),
            watcher: RefCell::new(None),
            handlers: RefCell::new(Vec::new()),
            fastpath: RefCell::new(HashMap::new()),
            unmatched: RefCell::new(Vec::new()),
            started_count: Cell::new(0),
            seq: Cell::new(0),
        });
        let watcher = Watcher::handle_watcher(&reactor, handle, PollEvents::IN, {
            let dispatcher = Rc::downgrade(&dispatcher);
            move |_, _, revents| {
                let Some(d) = dispatcher.upgrade() else { return };
                if revents.contains(PollEvents::ERR) {
                    log::error!(target: "fabric::dispatch", "Fatal handle watcher error");
                    return;
                }
                d.dispatch_one();
            }
        })?;
        *dispatcher.watcher.borrow_mut() = Some(watcher);
        *handle.dispatch_slot().borrow_mut() = Some(dispatcher.clone());
        Ok(dispatcher)
    }

    fn next_seq(&self) -> u64 {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        seq
    }

    fn handler_started(&self, state: &Rc<HandlerState>) {
        if state.match_.typemask & MessageType::Response as u8 != 0
            && state.match_.matchtag != MATCHTAG_NONE
        {
            self.fastpath
                .borrow_mut()
                .insert(state.match_.matchtag, state.clone());
        }
        let count = self.started_count.get();
        self.started_count.set(count + 1);
        if count == 0 {
            if let Some(w) = &*self.watcher.borrow() {
                w.start();
            }
        }
    }

    fn handler_stopped(&self, state: &Rc<HandlerState>) {
        if state.match_.matchtag != MATCHTAG_NONE {
            let mut fastpath = self.fastpath.borrow_mut();
            if fastpath
                .get(&state.match_.matchtag)
                .map(|cur| Rc::ptr_eq(cur, state))
                .unwrap_or(false)
            {
                fastpath.remove(&state.match_.matchtag);
            }
        }
        let count = self.started_count.get().saturating_sub(1);
        self.started_count.set(count);
        if count == 0 {
            if let Some(w) = &*self.watcher.borrow() {
                w.stop();
            }
        }
    }

    /// Pull and deliver one message. Called once per reactor iteration by
    /// the handle watcher.
    fn dispatch_one(&self) {
        let Some(handle) = self.handle.upgrade() else {
            return;
        };
        let msg = match handle.recv(&Match::any(), HandleFlags::NONBLOCK) {
            Ok(msg) => msg,
            Err(e) if e.is_would_block() => return,
            Err(e) => {
                log::error!(target: "fabric::dispatch", "Receive error: {e}");
                return;
            }
        };
        match msg.mtype() {
            MessageType::Response => self.dispatch_response(&handle, msg),
            MessageType::Request => self.dispatch_request(&handle, msg),
            MessageType::Event | MessageType::Control => self.dispatch_multi(&handle, msg),
        }
    }

    fn call_handler(&self, handle: &Handle, state: &Rc<HandlerState>, msg: &Message) {
        let mh = MessageHandler {
            state: state.clone(),
        };
        let mut cb = state.cb.borrow_mut();
        if let Some(cb) = cb.as_mut() {
            cb(handle, &mh, msg);
        }
    }

    fn dispatch_response(&self, handle: &Handle, msg: Message) {
        // The fast path only applies to matchtags from this handle's own
        // pool; a response still carrying routes belongs to another domain.
        if msg.matchtag() != MATCHTAG_NONE && msg.route().count() == 0 {
            let hit = self.fastpath.borrow().get(&msg.matchtag()).cloned();
            if let Some(state) = hit {
                if state.started.get() && state.match_.matches(&msg) {
                    self.call_handler(handle, &state, &msg);
                    return;
                }
            }
        } else if self.dispatch_globs(handle, &msg) {
            return;
        }
        self.unhandled(handle, msg);
    }

    /// Glob handlers in registration order; first match wins.
    fn dispatch_globs(&self, handle: &Handle, msg: &Message) -> bool {
        let handlers: Vec<Rc<HandlerState>> = self.handlers.borrow().clone();
        for state in handlers {
            if state.started.get()
                && state.match_.matchtag == MATCHTAG_NONE
                && state.match_.matches(msg)
            {
                self.call_handler(handle, &state, msg);
                return true;
            }
        }
        false
    }

    fn dispatch_request(&self, handle: &Handle, msg: Message) {
        // Exact-topic handlers override glob handlers, and among them the
        // last registered wins.
        let exact: Option<Rc<HandlerState>> = {
            let handlers = self.handlers.borrow();
            handlers
                .iter()
                .filter(|s| {
                    s.started.get()
                        && s.match_.is_exact_topic()
                        && s.match_.matches(&msg)
                })
                .max_by_key(|s| s.seq)
                .cloned()
        };
        if let Some(state) = exact {
            self.call_handler(handle, &state, &msg);
            return;
        }
        if self.dispatch_globs(handle, &msg) {
            return;
        }
        if !msg.is_noresponse() {
            log::debug!(
                target: "fabric::dispatch",
                "Unhandled request topic={}", msg.topic().unwrap_or("-")
            );
            if let Ok(mut rep) = Message::response_derive(&msg, Errno::ENOSYS.raw()) {
                rep.set_string("Unhandled request");
                if let Err(e) = handle.send(&rep, HandleFlags::NONE) {
                    log::error!(target: "fabric::dispatch", "Error responding to unhandled request: {e}");
                }
            }
        }
    }

    /// Events and control messages go to every matching handler.
    fn dispatch_multi(&self, handle: &Handle, msg: Message) {
        let handlers: Vec<Rc<HandlerState>> = self.handlers.borrow().clone();
        let mut delivered = false;
        for state in handlers {
            if state.started.get()
                && state.match_.matchtag == MATCHTAG_NONE
                && state.match_.matches(&msg)
            {
                self.call_handler(handle, &state, &msg);
                delivered = true;
            }
        }
        if !delivered {
            log::trace!(
                target: "fabric::dispatch",
                "Undelivered {} topic={}", msg.mtype(), msg.topic().unwrap_or("-")
            );
        }
    }

    /// Unroutable messages are parked on clones (the parent may want
    /// them); other handles drop them.
    fn unhandled(&self, handle: &Handle, msg: Message) {
        if handle.flags().contains(HandleFlags::CLONE) {
            self.unmatched.borrow_mut().push(msg);
        } else {
            log::debug!(
                target: "fabric::dispatch",
                "Discarded unmatched response tag={}", msg.matchtag()
            );
        }
    }
}

impl Handle {
    /// Return messages this handle's dispatcher could not deliver to the
    /// receive queue (at the clone ancestor), preserving order.
    pub fn dispatch_requeue(&self) {
        let slot = self.dispatch_slot();
        let Some(dispatcher) = &*slot.borrow() else {
            return;
        };
        let unmatched: Vec<Message> = dispatcher.unmatched.borrow_mut().drain(..).collect();
        for msg in unmatched {
            self.requeue_owned(msg, Requeue::Tail);
        }
    }
}
