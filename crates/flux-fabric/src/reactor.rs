//! Single-threaded cooperative event loop.
//!
//! A [`Reactor`] owns a set of [`Watcher`]s and drives their callbacks from
//! `run`. No callback runs concurrently with another on the same reactor;
//! callbacks may freely start and stop other watchers on the same reactor.
//!
//! Loop order within one iteration: prepare watchers, poll (blocking unless
//! an idle watcher is active or `NoWait` was given), fd/signal events, timer
//! and periodic expiries, idle watchers, then check watchers. `run` exits
//! when no active referenced watcher remains, when a single pass was
//! requested, or when a callback calls [`Reactor::stop`] /
//! [`Reactor::stop_error`].
pub(crate) mod timer;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant, SystemTime};

use mio::unix::SourceFd;
use mio::{Interest, Token};

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::watcher::{Kind, Watcher, WatcherState};
use timer::{Timer, TimerKey};

/// Token reserved for the process signal pipe; watcher ids start above it.
const SIGNAL_TOKEN: Token = Token(0);

/// How [`Reactor::run`] should advance.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum RunFlags {
    /// Run until quiescent or stopped.
    #[default]
    Default,
    /// One blocking iteration.
    Once,
    /// One non-blocking pass.
    NoWait,
}

pub(crate) struct State {
    poll: mio::Poll,
    watchers: HashMap<u64, Weak<WatcherState>>,
    next_id: u64,
    timer: Timer,
    /// Count of active, referenced watchers; the loop runs while > 0.
    active_refs: usize,
    /// `Some(None)` = stop, `Some(Some(e))` = stop with error.
    stop: Option<Option<Errno>>,
    /// Watchers to stop at the top of the next iteration.
    safe_stops: Vec<u64>,
    signal_pipe_registered: bool,
}

pub(crate) struct Inner {
    pub(crate) state: RefCell<State>,
}

/// A cooperative event loop. Cloning is reference counting.
#[derive(Clone)]
pub struct Reactor {
    pub(crate) inner: Rc<Inner>,
}

impl Reactor {
    pub fn new() -> Result<Self, Errno> {
        let poll = mio::Poll::new().map_err(Errno::from)?;
        Ok(Self {
            inner: Rc::new(Inner {
                state: RefCell::new(State {
                    poll,
                    watchers: HashMap::new(),
                    next_id: SIGNAL_TOKEN.0 as u64 + 1,
                    timer: Timer::new(),
                    active_refs: 0,
                    stop: None,
                    safe_stops: Vec::new(),
                    signal_pipe_registered: false,
                }),
            }),
        })
    }

    /// Current wall-clock time in seconds since the epoch, as used by
    /// periodic watchers.
    pub fn time() -> f64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Advance the loop.
    ///
    /// Returns the number of active referenced watchers remaining when the
    /// loop exited: 0 on a natural finish, more when `stop` interrupted live
    /// watchers or a single pass was requested. A callback calling
    /// `stop_error` makes `run` return that error instead.
    pub fn run(&self, flags: RunFlags) -> Result<usize, Errno> {
        self.inner.state.borrow_mut().stop = None;
        let mut events = mio::Events::with_capacity(256);

        loop {
            if self.inner.state.borrow().active_refs == 0 {
                return Ok(0);
            }
            self.iterate(flags == RunFlags::NoWait, &mut events)?;

            let (stop, active_refs) = {
                let st = self.inner.state.borrow();
                (st.stop, st.active_refs)
            };
            match stop {
                Some(Some(errno)) => return Err(errno),
                Some(None) => return Ok(active_refs),
                None => {}
            }
            if flags != RunFlags::Default {
                return Ok(active_refs);
            }
        }
    }

    /// Stop the loop; `run` returns after the current iteration.
    pub fn stop(&self) {
        self.inner.state.borrow_mut().stop = Some(None);
    }

    /// Stop the loop with an error; `run` returns `Err(errno)`.
    pub fn stop_error(&self, errno: Errno) {
        self.inner.state.borrow_mut().stop = Some(Some(errno));
    }

    /// One loop iteration.
    fn iterate(&self, nowait: bool, events: &mut mio::Events) -> Result<(), Errno> {
        self.run_safe_stops();
        self.dispatch_simple(|k| matches!(k, Kind::Prepare));

        let timeout = {
            let st = self.inner.state.borrow();
            if nowait || self.any_active_idle(&st) {
                Some(Duration::ZERO)
            } else {
                st.timer.next_expiring_from(Instant::now())
            }
        };

        {
            let mut st = self.inner.state.borrow_mut();
            if let Err(e) = st.poll.poll(events, timeout) {
                if e.kind() != std::io::ErrorKind::Interrupted {
                    log::error!(target: "fabric::reactor", "Error during polling: {e}");
                    return Err(e.into());
                }
            }
        }

        // I/O and signal events.
        let mut fired: Vec<(Rc<WatcherState>, PollEvents)> = Vec::new();
        let mut signals: Vec<flux_signals::Signal> = Vec::new();
        {
            let st = self.inner.state.borrow();
            for event in events.iter() {
                if event.token() == SIGNAL_TOKEN {
                    signals = flux_signals::drain();
                    continue;
                }
                let id = event.token().0 as u64;
                let Some(w) = st.watchers.get(&id).and_then(Weak::upgrade) else {
                    continue;
                };
                let mut revents = PollEvents::NONE;
                if event.is_readable() {
                    revents |= PollEvents::IN;
                }
                if event.is_writable() {
                    revents |= PollEvents::OUT;
                }
                if event.is_error() || event.is_read_closed() || event.is_write_closed() {
                    revents |= PollEvents::ERR;
                }
                fired.push((w, revents));
            }
        }
        if !signals.is_empty() {
            self.collect_signal_watchers(&signals, &mut fired);
        }
        for (w, revents) in fired {
            // An earlier callback in this batch may have stopped it.
            if w.active.get() {
                self.call(&w, revents);
            }
        }

        // Timer, periodic and stat expiries.
        let expired = {
            let mut st = self.inner.state.borrow_mut();
            st.timer.remove_expired_by(Instant::now())
        };
        for id in expired {
            let Some(w) = self.lookup(id) else { continue };
            self.timer_fired(&w);
        }

        self.dispatch_simple(|k| matches!(k, Kind::Idle));
        self.dispatch_checks();
        Ok(())
    }

    fn lookup(&self, id: u64) -> Option<Rc<WatcherState>> {
        self.inner.state.borrow().watchers.get(&id).and_then(Weak::upgrade)
    }

    fn any_active_idle(&self, st: &State) -> bool {
        st.watchers.values().any(|w| {
            w.upgrade()
                .map(|w| w.active.get() && matches!(&*w.kind.borrow(), Kind::Idle))
                .unwrap_or(false)
        })
    }

    fn run_safe_stops(&self) {
        let stops = std::mem::take(&mut self.inner.state.borrow_mut().safe_stops);
        for id in stops {
            if let Some(w) = self.lookup(id) {
                Watcher::from_state(w).stop();
            }
        }
    }

    /// Dispatch every active watcher whose kind matches `pred`.
    fn dispatch_simple(&self, pred: fn(&Kind) -> bool) {
        let batch: Vec<Rc<WatcherState>> = {
            let st = self.inner.state.borrow();
            st.watchers
                .values()
                .filter_map(Weak::upgrade)
                .filter(|w| w.active.get() && pred(&w.kind.borrow()))
                .collect()
        };
        for w in batch {
            if w.active.get() {
                self.call(&w, PollEvents::NONE);
            }
        }
    }

    /// Check watchers run last, higher priority first.
    fn dispatch_checks(&self) {
        let mut batch: Vec<Rc<WatcherState>> = {
            let st = self.inner.state.borrow();
            st.watchers
                .values()
                .filter_map(Weak::upgrade)
                .filter(|w| w.active.get() && matches!(&*w.kind.borrow(), Kind::Check))
                .collect()
        };
        batch.sort_by_key(|w| std::cmp::Reverse(w.priority.get()));
        for w in batch {
            if w.active.get() {
                self.call(&w, PollEvents::NONE);
            }
        }
    }

    fn collect_signal_watchers(
        &self,
        signals: &[flux_signals::Signal],
        fired: &mut Vec<(Rc<WatcherState>, PollEvents)>,
    ) {
        let st = self.inner.state.borrow();
        for w in st.watchers.values().filter_map(Weak::upgrade) {
            if !w.active.get() {
                continue;
            }
            match &*w.kind.borrow() {
                Kind::Signal { signal } => {
                    if signals.contains(signal) {
                        fired.push((w.clone(), PollEvents::NONE));
                    }
                }
                Kind::Child { pid, rpid, rstatus } => {
                    if !signals.contains(&flux_signals::Signal::Child) {
                        continue;
                    }
                    let mut status: libc::c_int = 0;
                    let ret = unsafe { libc::waitpid(*pid, &mut status, libc::WNOHANG) };
                    if ret > 0 {
                        rpid.set(ret);
                        rstatus.set(status);
                        fired.push((w.clone(), PollEvents::NONE));
                    }
                }
                _ => {}
            }
        }
    }

    /// Handle an expired timer deadline: auto-stop one-shots, re-arm
    /// repeating timers, periodics and stat samplers, then fire.
    fn timer_fired(&self, w: &Rc<WatcherState>) {
        if !w.active.get() {
            return;
        }
        enum Action {
            Timer { repeat: Duration },
            Stat,
            PeriodicFixed,
            PeriodicResched,
            PeriodicOneShot,
            Ignore,
        }
        let action = match &*w.kind.borrow() {
            Kind::Timer { repeat, .. } => Action::Timer { repeat: *repeat },
            Kind::Stat { .. } => Action::Stat,
            Kind::Periodic {
                reschedule: Some(_),
                ..
            } => Action::PeriodicResched,
            Kind::Periodic { interval, .. } if *interval > 0.0 => Action::PeriodicFixed,
            Kind::Periodic { .. } => Action::PeriodicOneShot,
            _ => Action::Ignore,
        };

        match action {
            Action::Timer { repeat } => {
                if repeat.is_zero() {
                    // One-shot timers stop automatically before the callback.
                    if let Kind::Timer { key, .. } = &mut *w.kind.borrow_mut() {
                        *key = None;
                    }
                    self.auto_stop(w);
                } else {
                    let key = self.arm_deadline(Instant::now() + repeat, w.id);
                    if let Kind::Timer { key: k, .. } = &mut *w.kind.borrow_mut() {
                        *k = Some(key);
                    }
                }
                self.call(w, PollEvents::NONE);
            }
            Action::Stat => {
                let changed = {
                    let mut kind = w.kind.borrow_mut();
                    let Kind::Stat {
                        path,
                        interval,
                        key,
                        cur,
                        prev,
                    } = &mut *kind
                    else {
                        return;
                    };
                    let next = crate::watcher::FileStat::snapshot(path);
                    let changed = next != *cur;
                    if changed {
                        *prev = *cur;
                        *cur = next;
                    }
                    let deadline = Instant::now() + *interval;
                    *key = Some(self.arm_deadline(deadline, w.id));
                    changed
                };
                if changed {
                    self.call(w, PollEvents::NONE);
                }
            }
            Action::PeriodicFixed => {
                {
                    let mut kind = w.kind.borrow_mut();
                    let Kind::Periodic { interval, key, at, .. } = &mut *kind else {
                        return;
                    };
                    let now = Reactor::time();
                    let mut next = *at;
                    while next <= now {
                        next += *interval;
                    }
                    *at = next;
                    *key = Some(self.arm_deadline(wall_to_instant(next), w.id));
                }
                self.call(w, PollEvents::NONE);
            }
            Action::PeriodicOneShot => {
                if let Kind::Periodic { key, .. } = &mut *w.kind.borrow_mut() {
                    *key = None;
                }
                self.auto_stop(w);
                self.call(w, PollEvents::NONE);
            }
            Action::PeriodicResched => {
                let taken = {
                    if let Kind::Periodic { reschedule, .. } = &mut *w.kind.borrow_mut() {
                        reschedule.take()
                    } else {
                        None
                    }
                };
                let Some(mut resched) = taken else { return };
                let now = Reactor::time();
                let next = resched(&Watcher::from_state(w.clone()), now);
                let mut safe_stop = false;
                {
                    let mut kind = w.kind.borrow_mut();
                    if let Kind::Periodic {
                        reschedule, key, at, ..
                    } = &mut *kind
                    {
                        *reschedule = Some(resched);
                        if next <= now {
                            // Stopping here would re-enter the loop
                            // structures; defer to the next prepare tick.
                            *key = None;
                            safe_stop = true;
                        } else {
                            *at = next;
                            *key = Some(self.arm_deadline(wall_to_instant(next), w.id));
                        }
                    }
                }
                if safe_stop {
                    self.queue_safe_stop(w.id);
                }
                self.call(w, PollEvents::NONE);
            }
            Action::Ignore => {}
        }
    }

    /// Stop bookkeeping for watchers that expire on their own.
    fn auto_stop(&self, w: &Rc<WatcherState>) {
        if w.active.replace(false) {
            if w.referenced.get() {
                self.inner.state.borrow_mut().active_refs -= 1;
            }
        }
    }

    /// Invoke a watcher callback outside any state borrow. Callers are
    /// responsible for checking the watcher is still meant to fire.
    fn call(&self, w: &Rc<WatcherState>, revents: PollEvents) {
        let watcher = Watcher::from_state(w.clone());
        let mut cb = w.cb.borrow_mut();
        if let Some(cb) = cb.as_mut() {
            cb(self, &watcher, revents);
        }
    }
}

/// Translate a wall-clock target into a monotonic deadline.
fn wall_to_instant(at: f64) -> Instant {
    let now = Reactor::time();
    let delta = (at - now).max(0.0);
    Instant::now() + Duration::from_secs_f64(delta)
}

impl Reactor {
    // Registration plumbing used by the watcher module.

    pub(crate) fn alloc_id(&self) -> u64 {
        let mut st = self.inner.state.borrow_mut();
        let id = st.next_id;
        st.next_id += 1;
        id
    }

    pub(crate) fn attach(&self, id: u64, weak: Weak<WatcherState>) {
        self.inner.state.borrow_mut().watchers.insert(id, weak);
    }

    pub(crate) fn detach(&self, id: u64) {
        self.inner.state.borrow_mut().watchers.remove(&id);
    }

    pub(crate) fn adjust_active_refs(&self, delta: isize) {
        let mut st = self.inner.state.borrow_mut();
        st.active_refs = st.active_refs.checked_add_signed(delta).unwrap_or(0);
    }

    pub(crate) fn arm_deadline(&self, deadline: Instant, id: u64) -> TimerKey {
        self.inner.state.borrow_mut().timer.set_deadline(deadline, id)
    }

    pub(crate) fn cancel_deadline(&self, key: TimerKey) {
        self.inner.state.borrow_mut().timer.cancel(key);
    }

    pub(crate) fn register_fd(
        &self,
        fd: std::os::unix::io::RawFd,
        id: u64,
        events: PollEvents,
    ) -> Result<(), Errno> {
        let st = self.inner.state.borrow();
        let mut interest = None;
        if events.contains(PollEvents::IN) {
            interest = Some(Interest::READABLE);
        }
        if events.contains(PollEvents::OUT) {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        let interest = interest.unwrap_or(Interest::READABLE);
        st.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(id as usize), interest)
            .map_err(Errno::from)
    }

    pub(crate) fn deregister_fd(&self, fd: std::os::unix::io::RawFd) {
        let st = self.inner.state.borrow();
        if let Err(e) = st.poll.registry().deregister(&mut SourceFd(&fd)) {
            log::warn!(target: "fabric::reactor", "Failed to deregister fd {fd}: {e}");
        }
    }

    /// Register the process signal pipe, once.
    pub(crate) fn register_signal_pipe(&self) -> Result<(), Errno> {
        let mut st = self.inner.state.borrow_mut();
        if st.signal_pipe_registered {
            return Ok(());
        }
        let fd = flux_signals::pipe_fd().map_err(Errno::from)?;
        st.poll
            .registry()
            .register(&mut SourceFd(&fd), SIGNAL_TOKEN, Interest::READABLE)
            .map_err(Errno::from)?;
        st.signal_pipe_registered = true;
        Ok(())
    }

    pub(crate) fn queue_safe_stop(&self, id: u64) {
        self.inner.state.borrow_mut().safe_stops.push(id);
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.borrow();
        f.debug_struct("Reactor")
            .field("watchers", &st.watchers.len())
            .field("active_refs", &st.active_refs)
            .finish()
    }
}
