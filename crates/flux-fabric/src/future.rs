//! Asynchronous result cells.
//!
//! A [`Future`] can be consumed two ways. In *now* mode, [`Future::get`] or
//! [`Future::wait_for`] block by spinning up a throw-away private reactor
//! until the future is fulfilled, the timeout expires (`ETIMEDOUT`, without
//! fulfillment, so the caller may retry in then mode), or the reactor runs
//! out of work (`EDEADLOCK`). In *then* mode, [`Future::then`] installs a
//! continuation fired from a check watcher on the iteration after
//! fulfillment, with an optional timer that fulfills the future with
//! `ETIMEDOUT` first.
//!
//! Fulfilling an already-fulfilled future queues the new result; `reset`
//! pops the queue. A *fatal* error is sticky and supersedes every other
//! result.
pub mod chain;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::aux::Aux;
use crate::errno::Errno;
use crate::handle::Handle;
use crate::reactor::{Reactor, RunFlags};
use crate::watcher::Watcher;

/// Hook invoked once per consumption context (now/then) so the future's
/// owner can register the watchers that will fulfill it.
pub type InitFn = Box<dyn FnMut(&Future)>;

/// Continuation invoked when the future is fulfilled (or times out).
pub type ContinuationFn = Box<dyn FnMut(&Future)>;

enum FutureResult {
    Value(Rc<dyn Any>),
    Error { errno: Errno, errstr: Option<String> },
}

struct NowContext {
    reactor: Reactor,
    /// Clone of the future's handle, bound to the private reactor.
    handle: RefCell<Option<Handle>>,
    timer: RefCell<Option<Watcher>>,
    init_called: Cell<bool>,
    running: Cell<bool>,
}

struct ThenContext {
    reactor: Reactor,
    timer: RefCell<Option<Watcher>>,
    timeout: Cell<Option<Duration>>,
    check: Watcher,
    idle: Watcher,
    init_called: Cell<bool>,
    continuation: RefCell<Option<ContinuationFn>>,
}

impl ThenContext {
    fn start(&self) {
        // The idle watcher keeps the loop from blocking until the check
        // watcher has delivered the continuation.
        self.idle.start();
        self.check.start();
    }

    fn stop(&self) {
        self.idle.stop();
        self.check.stop();
    }

    fn set_timeout(&self, timeout: Option<Duration>, future: &Future) {
        self.timeout.set(timeout);
        match timeout {
            None => {
                if let Some(timer) = &*self.timer.borrow() {
                    timer.stop();
                }
            }
            Some(timeout) => {
                let mut slot = self.timer.borrow_mut();
                if slot.is_none() {
                    let weak = future.downgrade();
                    *slot = Some(Watcher::timer(
                        &self.reactor,
                        timeout,
                        timeout,
                        move |_, _, _| {
                            if let Some(f) = weak.upgrade() {
                                f.fulfill_error(Errno::ETIMEDOUT, None);
                            }
                        },
                    ));
                }
                let timer = slot.as_ref().expect("just set");
                timer.timer_reset(timeout, timeout);
                timer.timer_again();
            }
        }
    }
}

pub(crate) struct FutureInner {
    reactor: RefCell<Option<Reactor>>,
    handle: RefCell<Option<Handle>>,
    aux: RefCell<Aux>,
    result: RefCell<Option<FutureResult>>,
    fatal: RefCell<Option<(Errno, Option<String>)>>,
    init: RefCell<Option<InitFn>>,
    now: RefCell<Option<Rc<NowContext>>>,
    then: RefCell<Option<Rc<ThenContext>>>,
    queue: RefCell<VecDeque<FutureResult>>,
    embed: RefCell<Option<Future>>,
    pub(crate) chain: RefCell<Option<Rc<chain::ChainState>>>,
}

/// An asynchronous result value. Cloning is reference counting.
#[derive(Clone)]
pub struct Future {
    inner: Rc<FutureInner>,
}

/// Non-owning future reference for watcher callbacks.
#[derive(Clone)]
pub struct WeakFuture {
    inner: Weak<FutureInner>,
}

impl WeakFuture {
    pub fn upgrade(&self) -> Option<Future> {
        self.inner.upgrade().map(|inner| Future { inner })
    }
}

impl Default for Future {
    fn default() -> Self {
        Self::new()
    }
}

impl Future {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(FutureInner {
                reactor: RefCell::new(None),
                handle: RefCell::new(None),
                aux: RefCell::new(Aux::new()),
                result: RefCell::new(None),
                fatal: RefCell::new(None),
                init: RefCell::new(None),
                now: RefCell::new(None),
                then: RefCell::new(None),
                queue: RefCell::new(VecDeque::new()),
                embed: RefCell::new(None),
                chain: RefCell::new(None),
            }),
        }
    }

    /// Create a future whose `init` hook runs once per consumption context.
    pub fn with_init(init: impl FnMut(&Future) + 'static) -> Self {
        let f = Self::new();
        *f.inner.init.borrow_mut() = Some(Box::new(init));
        f
    }

    pub fn downgrade(&self) -> WeakFuture {
        WeakFuture {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub(crate) fn same(&self, other: &Future) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Set the reactor used by then mode.
    pub fn set_reactor(&self, reactor: &Reactor) {
        *self.inner.reactor.borrow_mut() = Some(reactor.clone());
    }

    /// The reactor of the current context: the private one while a blocking
    /// wait is running, else the one set by [`Future::set_reactor`].
    pub fn reactor(&self) -> Result<Reactor, Errno> {
        let now_running = self
            .inner
            .now
            .borrow()
            .as_ref()
            .map(|n| n.running.get())
            .unwrap_or(false);
        if now_running {
            let now = self.inner.now.borrow();
            return Ok(now.as_ref().expect("running now context").reactor.clone());
        }
        self.inner.reactor.borrow().clone().ok_or(Errno::EINVAL)
    }

    /// Bind a handle. Also adopts the handle's reactor unless one was set.
    pub fn set_handle(&self, handle: &Handle) -> Result<(), Errno> {
        *self.inner.handle.borrow_mut() = Some(handle.clone());
        if self.inner.reactor.borrow().is_none() {
            *self.inner.reactor.borrow_mut() = Some(handle.reactor()?);
        }
        Ok(())
    }

    /// The handle of the current context. While a blocking wait is running
    /// this is a clone bound to the private reactor, so messages the future
    /// does not consume can be requeued to the parent on return.
    pub fn handle(&self) -> Result<Handle, Errno> {
        let handle = self.inner.handle.borrow().clone().ok_or(Errno::EINVAL)?;
        let now = self.inner.now.borrow().clone();
        match now {
            Some(now) if now.running.get() => {
                let mut slot = now.handle.borrow_mut();
                if slot.is_none() {
                    let clone = handle.clone_handle();
                    clone.set_reactor(&now.reactor)?;
                    *slot = Some(clone);
                }
                Ok(slot.as_ref().expect("just set").clone())
            }
            _ => Ok(handle),
        }
    }

    pub fn aux_set<T: Any>(&self, key: &str, val: T) {
        self.inner.aux.borrow_mut().set(key, val);
    }

    /// Keep a value alive for the future's lifetime without naming it.
    pub fn aux_append<T: Any>(&self, val: T) {
        self.inner.aux.borrow_mut().append(val);
    }

    /// Aux lookup, falling back to an embedded future's table.
    pub fn aux_get<T: Any + Clone>(&self, key: &str) -> Result<T, Errno> {
        if let Ok(v) = self.inner.aux.borrow().get::<T>(key) {
            return Ok(v.clone());
        }
        if let Some(embed) = &*self.inner.embed.borrow() {
            return embed.aux_get(key);
        }
        Err(Errno::ENOENT)
    }

    fn is_ready_internal(&self) -> bool {
        self.inner.fatal.borrow().is_some() || self.inner.result.borrow().is_some()
    }

    /// True when a result (or fatal error) is available and `get` will not
    /// block.
    pub fn is_ready(&self) -> bool {
        self.is_ready_internal()
    }

    fn call_init(&self) {
        let init = self.inner.init.borrow_mut().take();
        if let Some(mut init) = init {
            init(self);
            let mut slot = self.inner.init.borrow_mut();
            if slot.is_none() {
                *slot = Some(init);
            }
        }
    }

    fn post_fulfill(&self) {
        if let Some(now) = &*self.inner.now.borrow() {
            if let Some(timer) = &*now.timer.borrow() {
                timer.stop();
            }
            now.reactor.stop();
        }
        if let Some(then) = &*self.inner.then.borrow() {
            then.start();
        }
    }

    fn install_result(&self, result: FutureResult) {
        if self.inner.fatal.borrow().is_some() {
            return;
        }
        if self.inner.result.borrow().is_some() {
            self.inner.queue.borrow_mut().push_back(result);
        } else {
            *self.inner.result.borrow_mut() = Some(result);
        }
        self.post_fulfill();
    }

    /// Fulfill with a success value.
    pub fn fulfill<T: Any>(&self, value: T) {
        self.fulfill_rc(Rc::new(value));
    }

    /// Fulfill with a shared success value.
    pub fn fulfill_rc(&self, value: Rc<dyn Any>) {
        self.install_result(FutureResult::Value(value));
    }

    /// Fulfill with an error and optional message.
    pub fn fulfill_error(&self, errno: Errno, errstr: Option<String>) {
        self.install_result(FutureResult::Error { errno, errstr });
    }

    /// Adopt the result (or fatal error) of a fulfilled future `p`.
    ///
    /// Only one distinct future may ever be adopted: adopting a second one
    /// fails with `EEXIST`. Adopting an unfulfilled future fails with
    /// `EAGAIN`.
    pub fn fulfill_with(&self, p: &Future) -> Result<(), Errno> {
        if self.same(p) {
            return Err(Errno::EINVAL);
        }
        {
            let embed = self.inner.embed.borrow();
            if let Some(cur) = &*embed {
                if !cur.same(p) {
                    return Err(Errno::EEXIST);
                }
            }
        }
        if !p.is_ready_internal() {
            return Err(Errno::EAGAIN);
        }
        if let Some((errno, errstr)) = p.inner.fatal.borrow().clone() {
            self.fatal_error(errno, errstr);
        } else {
            match &*p.inner.result.borrow() {
                Some(FutureResult::Error { errno, errstr }) => {
                    self.fulfill_error(*errno, errstr.clone());
                }
                Some(FutureResult::Value(v)) => {
                    self.fulfill_rc(v.clone());
                }
                None => unreachable!("ready future has a result"),
            }
        }
        let mut embed = self.inner.embed.borrow_mut();
        if embed.is_none() {
            *embed = Some(p.clone());
        }
        Ok(())
    }

    /// Set a sticky fatal error that supersedes any result; later
    /// fulfillment attempts are dropped silently.
    pub fn fatal_error(&self, errno: Errno, errstr: Option<String>) {
        {
            let mut fatal = self.inner.fatal.borrow_mut();
            if fatal.is_none() {
                *fatal = Some((errno, errstr));
            }
        }
        self.post_fulfill();
    }

    /// Unfulfill the future; if queued results are pending, the next one
    /// takes effect immediately.
    pub fn reset(&self) {
        *self.inner.result.borrow_mut() = None;
        if let Some(then) = &*self.inner.then.borrow() {
            then.stop();
            then.set_timeout(then.timeout.get(), self);
        }
        let next = self.inner.queue.borrow_mut().pop_front();
        if let Some(result) = next {
            *self.inner.result.borrow_mut() = Some(result);
            self.post_fulfill();
        }
    }

    /// Block until the future is fulfilled or `timeout` expires.
    ///
    /// `Some(Duration::ZERO)` fails `ETIMEDOUT` immediately; `None` waits
    /// forever. A timeout does not fulfill the future. If the private
    /// reactor runs out of work first, fails `EDEADLOCK`.
    pub fn wait_for(&self, timeout: Option<Duration>) -> Result<(), Errno> {
        if !self.is_ready_internal() {
            if timeout == Some(Duration::ZERO) {
                return Err(Errno::ETIMEDOUT);
            }
            {
                let mut slot = self.inner.now.borrow_mut();
                if slot.is_none() {
                    *slot = Some(Rc::new(NowContext {
                        reactor: Reactor::new()?,
                        handle: RefCell::new(None),
                        timer: RefCell::new(None),
                        init_called: Cell::new(false),
                        running: Cell::new(false),
                    }));
                }
            }
            let now = self.inner.now.borrow().clone().expect("now context set");
            self.now_set_timeout(&now, timeout);
            now.running.set(true);
            if !now.init_called.get() {
                self.call_init(); // may fulfill or set an error
                now.init_called.set(true);
            }
            let result = if !self.is_ready_internal() {
                now.reactor.run(RunFlags::Default).map(|_| ())
            } else {
                Ok(())
            };
            if let Some(h) = &*now.handle.borrow() {
                h.dispatch_requeue();
            }
            now.running.set(false);
            result?;
        }
        if !self.is_ready_internal() {
            // The private reactor returned without fulfilling: no init was
            // registered, it registered nothing, or its watchers gave up.
            return Err(Errno::EDEADLOCK);
        }
        Ok(())
    }

    fn now_set_timeout(&self, now: &NowContext, timeout: Option<Duration>) {
        match timeout {
            None => {
                if let Some(timer) = &*now.timer.borrow() {
                    timer.stop();
                }
            }
            Some(timeout) => {
                let mut slot = now.timer.borrow_mut();
                if slot.is_none() {
                    let reactor = now.reactor.clone();
                    *slot = Some(Watcher::timer(
                        &reactor,
                        timeout,
                        Duration::ZERO,
                        move |r, _, _| {
                            // Stop the wait without fulfilling; the caller
                            // may retry or fall back to then mode.
                            r.stop_error(Errno::ETIMEDOUT);
                        },
                    ));
                } else {
                    let timer = slot.as_ref().expect("timer present");
                    timer.timer_reset(timeout, Duration::ZERO);
                }
                slot.as_ref().expect("timer present").start();
            }
        }
    }

    /// Block until fulfilled, then return the success value.
    pub fn get(&self) -> Result<Rc<dyn Any>, Errno> {
        self.wait_for(None)?;
        if let Some((errno, _)) = &*self.inner.fatal.borrow() {
            return Err(*errno);
        }
        match &*self.inner.result.borrow() {
            Some(FutureResult::Error { errno, .. }) => Err(*errno),
            Some(FutureResult::Value(v)) => Ok(v.clone()),
            None => unreachable!("wait_for returned without result"),
        }
    }

    /// Like [`Future::get`], downcast to the expected type.
    pub fn get_as<T: Any>(&self) -> Result<Rc<T>, Errno> {
        self.get()?.downcast::<T>().map_err(|_| Errno::EINVAL)
    }

    /// Install a continuation to run once the future is fulfilled; an
    /// expired `timeout` fulfills it with `ETIMEDOUT` first.
    pub fn then(
        &self,
        timeout: Option<Duration>,
        cb: impl FnMut(&Future) + 'static,
    ) -> Result<(), Errno> {
        let reactor = self.inner.reactor.borrow().clone().ok_or(Errno::EINVAL)?;
        {
            let mut slot = self.inner.then.borrow_mut();
            if slot.is_none() {
                let weak = self.downgrade();
                let check = Watcher::check(&reactor, move |_, _, _| {
                    if let Some(f) = weak.upgrade() {
                        f.then_check();
                    }
                });
                let idle = Watcher::idle_noop(&reactor);
                *slot = Some(Rc::new(ThenContext {
                    reactor: reactor.clone(),
                    timer: RefCell::new(None),
                    timeout: Cell::new(None),
                    check,
                    idle,
                    init_called: Cell::new(false),
                    continuation: RefCell::new(None),
                }));
            }
        }
        let then = self.inner.then.borrow().clone().expect("then context set");
        if self.is_ready_internal() {
            then.start();
        }
        then.set_timeout(timeout, self);
        *then.continuation.borrow_mut() = Some(Box::new(cb));
        if !then.init_called.get() {
            self.call_init();
            then.init_called.set(true);
        }
        Ok(())
    }

    /// Check-watcher body: deliver the continuation once per fulfillment.
    fn then_check(&self) {
        let then = self.inner.then.borrow().clone();
        let Some(then) = then else { return };
        if let Some(timer) = &*then.timer.borrow() {
            timer.stop();
        }
        then.stop();
        let mut cont = then.continuation.borrow_mut().take();
        if let Some(cb) = cont.as_mut() {
            cb(self);
        }
        // The continuation may have re-registered with `then`.
        if let Some(cb) = cont {
            let mut slot = then.continuation.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    /// True if the future is fulfilled with an error (fatal included).
    pub fn has_error(&self) -> bool {
        if self.inner.fatal.borrow().is_some() {
            return true;
        }
        matches!(&*self.inner.result.borrow(), Some(FutureResult::Error { .. }))
    }

    /// The error number of a failed future, if any.
    pub fn error(&self) -> Option<Errno> {
        if let Some((errno, _)) = &*self.inner.fatal.borrow() {
            return Some(*errno);
        }
        match &*self.inner.result.borrow() {
            Some(FutureResult::Error { errno, .. }) => Some(*errno),
            _ => None,
        }
    }

    /// Human-readable error text: the optional error string if one was
    /// given, else the `strerror` of the error number.
    pub fn error_string(&self) -> Option<String> {
        if let Some((errno, errstr)) = &*self.inner.fatal.borrow() {
            return Some(errstr.clone().unwrap_or_else(|| errno.strerror().to_owned()));
        }
        match &*self.inner.result.borrow() {
            Some(FutureResult::Error { errno, errstr }) => {
                Some(errstr.clone().unwrap_or_else(|| errno.strerror().to_owned()))
            }
            _ => None,
        }
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("ready", &self.is_ready_internal())
            .field("fatal", &self.inner.fatal.borrow().is_some())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}
