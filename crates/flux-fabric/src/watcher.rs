//! Watchers: uniform lifecycle objects over events.
//!
//! Every watcher is created against a [`Reactor`], started, fired through
//! its callback, stopped, and dropped. `start` after `stop` re-arms;
//! dropping the last handle implies stop. An unreferenced active watcher
//! does not by itself keep the reactor running (see [`Watcher::unref`]).
pub mod handle;
pub mod socket;

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use flux_signals::Signal;

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::reactor::timer::TimerKey;
use crate::reactor::Reactor;

/// Watcher callback signature.
pub type Callback = Box<dyn FnMut(&Reactor, &Watcher, PollEvents)>;

/// Reschedule hook for periodic watchers: given the current wall-clock time
/// (seconds since the epoch), return the next absolute fire time.
pub type RescheduleFn = Box<dyn FnMut(&Watcher, f64) -> f64>;

/// Snapshot of file metadata, as reported by stat watchers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub exists: bool,
    pub size: u64,
    pub mtime_secs: i64,
    pub mtime_nanos: i64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
}

impl FileStat {
    pub(crate) fn snapshot(path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt;
        match std::fs::metadata(path) {
            Ok(md) => Self {
                exists: true,
                size: md.size(),
                mtime_secs: md.mtime(),
                mtime_nanos: md.mtime_nsec(),
                ino: md.ino(),
                mode: md.mode(),
                nlink: md.nlink(),
            },
            Err(_) => Self::default(),
        }
    }
}

/// Lifecycle hooks for aggregate watchers composed of inner watchers.
pub(crate) trait CompositeOps {
    fn start(&self);
    fn stop(&self);
    fn is_active(&self) -> bool;
    fn set_ref(&self, on: bool);
}

/// Per-variant scheduling state.
pub(crate) enum Kind {
    Fd {
        fd: std::os::unix::io::RawFd,
        events: PollEvents,
    },
    Timer {
        after: Duration,
        repeat: Duration,
        key: Option<TimerKey>,
    },
    Periodic {
        offset: f64,
        interval: f64,
        reschedule: Option<RescheduleFn>,
        /// Next absolute fire time (seconds since the epoch).
        at: f64,
        key: Option<TimerKey>,
    },
    Prepare,
    Check,
    Idle,
    Signal {
        signal: Signal,
    },
    Child {
        pid: i32,
        rpid: Cell<i32>,
        rstatus: Cell<i32>,
    },
    Stat {
        path: PathBuf,
        interval: Duration,
        key: Option<TimerKey>,
        cur: FileStat,
        prev: FileStat,
    },
    Composite(Rc<dyn CompositeOps>),
}

pub(crate) struct WatcherState {
    pub(crate) reactor: Reactor,
    pub(crate) id: u64,
    pub(crate) kind: RefCell<Kind>,
    pub(crate) cb: RefCell<Option<Callback>>,
    pub(crate) active: Cell<bool>,
    pub(crate) referenced: Cell<bool>,
    pub(crate) priority: Cell<i32>,
}

/// A reactor-owned event source. Cloning returns another handle to the same
/// watcher; dropping the last handle stops and removes it.
#[derive(Clone)]
pub struct Watcher {
    state: Rc<WatcherState>,
}

/// Default sampling interval for stat watchers when 0 is given.
const STAT_DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

impl Watcher {
    fn create(reactor: &Reactor, kind: Kind, cb: Option<Callback>) -> Watcher {
        let id = reactor.alloc_id();
        let state = Rc::new(WatcherState {
            reactor: reactor.clone(),
            id,
            kind: RefCell::new(kind),
            cb: RefCell::new(cb),
            active: Cell::new(false),
            referenced: Cell::new(true),
            priority: Cell::new(0),
        });
        reactor.attach(id, Rc::downgrade(&state));
        Watcher { state }
    }

    pub(crate) fn from_state(state: Rc<WatcherState>) -> Watcher {
        Watcher { state }
    }

    pub(crate) fn state(&self) -> &Rc<WatcherState> {
        &self.state
    }

    /// Watch a file descriptor for the given events. The fired event mask is
    /// edge-triggered.
    pub fn fd(
        reactor: &Reactor,
        fd: std::os::unix::io::RawFd,
        events: PollEvents,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(reactor, Kind::Fd { fd, events }, Some(Box::new(cb)))
    }

    /// Fire once after `after`, then every `repeat` (or once if zero).
    pub fn timer(
        reactor: &Reactor,
        after: Duration,
        repeat: Duration,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(
            reactor,
            Kind::Timer {
                after,
                repeat,
                key: None,
            },
            Some(Box::new(cb)),
        )
    }

    /// Fire on an absolute wall-clock schedule.
    ///
    /// `offset` and `interval` are in seconds since the epoch / seconds. A
    /// `reschedule` hook, if given, overrides `interval` by computing each
    /// next fire time; returning a time not in the future stops the watcher
    /// safely on the next iteration.
    pub fn periodic(
        reactor: &Reactor,
        offset: f64,
        interval: f64,
        reschedule: Option<RescheduleFn>,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Result<Watcher, Errno> {
        if offset < 0.0 || interval < 0.0 {
            return Err(Errno::EINVAL);
        }
        Ok(Self::create(
            reactor,
            Kind::Periodic {
                offset,
                interval,
                reschedule,
                at: 0.0,
                key: None,
            },
            Some(Box::new(cb)),
        ))
    }

    /// Run immediately before the loop blocks.
    pub fn prepare(
        reactor: &Reactor,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(reactor, Kind::Prepare, Some(Box::new(cb)))
    }

    /// Run after each poll, after all event handlers. May carry a priority.
    pub fn check(
        reactor: &Reactor,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(reactor, Kind::Check, Some(Box::new(cb)))
    }

    /// Fire every iteration, preventing the loop from blocking.
    pub fn idle(
        reactor: &Reactor,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(reactor, Kind::Idle, Some(Box::new(cb)))
    }

    /// An idle watcher with no callback; keeps the loop spinning.
    pub fn idle_noop(reactor: &Reactor) -> Watcher {
        Self::create(reactor, Kind::Idle, None)
    }

    /// Reactor-level signal handler.
    pub fn signal(
        reactor: &Reactor,
        signal: Signal,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(reactor, Kind::Signal { signal }, Some(Box::new(cb)))
    }

    /// Report exit status of a child process.
    pub fn child(
        reactor: &Reactor,
        pid: i32,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        Self::create(
            reactor,
            Kind::Child {
                pid,
                rpid: Cell::new(0),
                rstatus: Cell::new(0),
            },
            Some(Box::new(cb)),
        )
    }

    /// Fire when file metadata at `path` changes, sampled every `interval`
    /// (a zero interval selects a default).
    pub fn stat(
        reactor: &Reactor,
        path: impl Into<PathBuf>,
        interval: Duration,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Watcher {
        let interval = if interval.is_zero() {
            STAT_DEFAULT_INTERVAL
        } else {
            interval
        };
        Self::create(
            reactor,
            Kind::Stat {
                path: path.into(),
                interval,
                key: None,
                cur: FileStat::default(),
                prev: FileStat::default(),
            },
            Some(Box::new(cb)),
        )
    }

    pub(crate) fn composite(
        reactor: &Reactor,
        ops: Rc<dyn CompositeOps>,
        cb: Option<Callback>,
    ) -> Watcher {
        Self::create(reactor, Kind::Composite(ops), cb)
    }

    /// The owning reactor.
    pub fn reactor(&self) -> &Reactor {
        &self.state.reactor
    }

    /// Arm the watcher. Starting an active watcher is a no-op.
    pub fn start(&self) {
        let st = &self.state;
        if let Kind::Composite(ops) = &*st.kind.borrow() {
            let ops = ops.clone();
            ops.start();
            return;
        }
        if st.active.get() {
            return;
        }
        let reactor = &st.reactor;
        {
            let mut kind = st.kind.borrow_mut();
            match &mut *kind {
                Kind::Fd { fd, events } => {
                    if let Err(e) = reactor.register_fd(*fd, st.id, *events) {
                        log::warn!(target: "fabric::watcher", "Failed to register fd {fd}: {e}");
                        return;
                    }
                }
                Kind::Timer { after, key, .. } => {
                    *key = Some(reactor.arm_deadline(Instant::now() + *after, st.id));
                }
                Kind::Periodic {
                    offset,
                    interval,
                    reschedule,
                    at,
                    key,
                } => {
                    let now = Reactor::time();
                    let next = match reschedule {
                        Some(_) => {
                            // The hook runs with the kind borrow held; it must
                            // not call back into this watcher.
                            let mut cb = reschedule.take().expect("reschedule present");
                            let next = cb(self, now);
                            *reschedule = Some(cb);
                            next
                        }
                        None if *interval > 0.0 => {
                            let mut next = *offset;
                            while next <= now {
                                next += *interval;
                            }
                            next
                        }
                        None => *offset,
                    };
                    *at = next;
                    let delta = (next - now).max(0.0);
                    *key = Some(
                        reactor.arm_deadline(Instant::now() + Duration::from_secs_f64(delta), st.id),
                    );
                }
                Kind::Stat {
                    path,
                    interval,
                    key,
                    cur,
                    prev,
                } => {
                    *cur = FileStat::snapshot(path);
                    *prev = *cur;
                    *key = Some(reactor.arm_deadline(Instant::now() + *interval, st.id));
                }
                Kind::Signal { signal } => {
                    let signal = *signal;
                    if let Err(e) = flux_signals::install(&[signal])
                        .map_err(Errno::from)
                        .and_then(|()| reactor.register_signal_pipe())
                    {
                        log::warn!(target: "fabric::watcher", "Failed to arm signal watcher: {e}");
                        return;
                    }
                }
                Kind::Child { .. } => {
                    if let Err(e) = flux_signals::install(&[Signal::Child])
                        .map_err(Errno::from)
                        .and_then(|()| reactor.register_signal_pipe())
                    {
                        log::warn!(target: "fabric::watcher", "Failed to arm child watcher: {e}");
                        return;
                    }
                }
                Kind::Prepare | Kind::Check | Kind::Idle => {}
                Kind::Composite(_) => unreachable!("composite handled above"),
            }
        }
        st.active.set(true);
        if st.referenced.get() {
            reactor.adjust_active_refs(1);
        }
    }

    /// Disarm the watcher. A stopped watcher holds no scheduling state.
    pub fn stop(&self) {
        let st = &self.state;
        if let Kind::Composite(ops) = &*st.kind.borrow() {
            let ops = ops.clone();
            ops.stop();
            return;
        }
        if !st.active.get() {
            return;
        }
        Self::disarm(st);
        st.active.set(false);
        if st.referenced.get() {
            st.reactor.adjust_active_refs(-1);
        }
    }

    fn disarm(st: &WatcherState) {
        let mut kind = st.kind.borrow_mut();
        match &mut *kind {
            Kind::Fd { fd, .. } => st.reactor.deregister_fd(*fd),
            Kind::Timer { key, .. } | Kind::Periodic { key, .. } | Kind::Stat { key, .. } => {
                if let Some(key) = key.take() {
                    st.reactor.cancel_deadline(key);
                }
            }
            _ => {}
        }
    }

    /// Whether the watcher is armed.
    pub fn is_active(&self) -> bool {
        if let Kind::Composite(ops) = &*self.state.kind.borrow() {
            return ops.is_active();
        }
        self.state.active.get()
    }

    /// Let the watcher count towards keeping the reactor alive (the
    /// default).
    pub fn ref_(&self) {
        let st = &self.state;
        if st.referenced.replace(true) {
            return;
        }
        if let Kind::Composite(ops) = &*st.kind.borrow() {
            ops.set_ref(true);
            return;
        }
        if st.active.get() {
            st.reactor.adjust_active_refs(1);
        }
    }

    /// Stop counting towards the reactor's keep-alive count: an active but
    /// unreferenced watcher does not prevent [`Reactor::run`] from
    /// returning.
    pub fn unref(&self) {
        let st = &self.state;
        if !st.referenced.replace(false) {
            return;
        }
        if let Kind::Composite(ops) = &*st.kind.borrow() {
            ops.set_ref(false);
            return;
        }
        if st.active.get() {
            st.reactor.adjust_active_refs(-1);
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.state.referenced.get()
    }

    /// Set dispatch priority; meaningful for check watchers (higher runs
    /// earlier).
    pub fn set_priority(&self, priority: i32) {
        self.state.priority.set(priority);
    }

    /// The watched descriptor of an fd watcher.
    pub fn fd_raw(&self) -> Result<std::os::unix::io::RawFd, Errno> {
        match &*self.state.kind.borrow() {
            Kind::Fd { fd, .. } => Ok(*fd),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Re-initialize a timer. Takes effect on the next start, or
    /// immediately if the timer is active.
    pub fn timer_reset(&self, after: Duration, repeat: Duration) {
        let st = &self.state;
        let mut kind = st.kind.borrow_mut();
        if let Kind::Timer {
            after: a,
            repeat: r,
            key,
        } = &mut *kind
        {
            *a = after;
            *r = repeat;
            if st.active.get() {
                if let Some(key) = key.take() {
                    st.reactor.cancel_deadline(key);
                }
                *key = Some(st.reactor.arm_deadline(Instant::now() + after, st.id));
            }
        }
    }

    /// Re-arm a repeating timer from "now"; a zero-repeat active timer is
    /// stopped, and an inactive repeating timer is started.
    pub fn timer_again(&self) {
        let st = &self.state;
        let (repeat, active) = match &*st.kind.borrow() {
            Kind::Timer { repeat, .. } => (*repeat, st.active.get()),
            _ => return,
        };
        if active {
            if repeat.is_zero() {
                self.stop();
            } else if let Kind::Timer { key, .. } = &mut *st.kind.borrow_mut() {
                if let Some(key) = key.take() {
                    st.reactor.cancel_deadline(key);
                }
                *key = Some(st.reactor.arm_deadline(Instant::now() + repeat, st.id));
            }
        } else if !repeat.is_zero() {
            if let Kind::Timer { after, .. } = &mut *st.kind.borrow_mut() {
                *after = repeat;
            }
            self.start();
        }
    }

    /// Re-initialize a periodic watcher.
    pub fn periodic_reset(&self, next: f64, interval: f64, reschedule: Option<RescheduleFn>) {
        let st = &self.state;
        let was_active = st.active.get();
        if was_active {
            self.stop();
        }
        if let Kind::Periodic {
            offset,
            interval: iv,
            reschedule: rs,
            ..
        } = &mut *st.kind.borrow_mut()
        {
            *offset = next;
            *iv = interval;
            *rs = reschedule;
        }
        if was_active {
            self.start();
        }
    }

    /// The absolute time (seconds since the epoch) of the next wakeup of a
    /// timer or periodic watcher.
    pub fn next_wakeup(&self) -> Result<f64, Errno> {
        match &*self.state.kind.borrow() {
            Kind::Periodic { at, .. } => Ok(*at),
            Kind::Timer { key, .. } => {
                let key = key.as_ref().ok_or(Errno::EINVAL)?;
                let remaining = key
                    .deadline()
                    .saturating_duration_since(Instant::now())
                    .as_secs_f64();
                Ok(Reactor::time() + remaining)
            }
            _ => Err(Errno::EINVAL),
        }
    }

    /// The signal a signal watcher is armed for.
    pub fn signal_kind(&self) -> Result<Signal, Errno> {
        match &*self.state.kind.borrow() {
            Kind::Signal { signal } => Ok(*signal),
            _ => Err(Errno::EINVAL),
        }
    }

    /// The `(pid, status)` reported by the last child watcher fire.
    pub fn child_status(&self) -> Result<(i32, i32), Errno> {
        match &*self.state.kind.borrow() {
            Kind::Child { rpid, rstatus, .. } => Ok((rpid.get(), rstatus.get())),
            _ => Err(Errno::EINVAL),
        }
    }

    /// Current and previous metadata snapshots of a stat watcher.
    pub fn stat_rstat(&self) -> Result<(FileStat, FileStat), Errno> {
        match &*self.state.kind.borrow() {
            Kind::Stat { cur, prev, .. } => Ok((*cur, *prev)),
            _ => Err(Errno::EINVAL),
        }
    }
}

impl Drop for WatcherState {
    fn drop(&mut self) {
        if self.active.get() {
            // Inline stop bookkeeping; the public wrapper is gone.
            if !matches!(&*self.kind.borrow(), Kind::Composite(_)) {
                Watcher::disarm(self);
                if self.referenced.get() {
                    self.reactor.adjust_active_refs(-1);
                }
            }
        }
        self.reactor.detach(self.id);
    }
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &*self.state.kind.borrow() {
            Kind::Fd { .. } => "fd",
            Kind::Timer { .. } => "timer",
            Kind::Periodic { .. } => "periodic",
            Kind::Prepare => "prepare",
            Kind::Check => "check",
            Kind::Idle => "idle",
            Kind::Signal { .. } => "signal",
            Kind::Child { .. } => "child",
            Kind::Stat { .. } => "stat",
            Kind::Composite(_) => "composite",
        };
        f.debug_struct("Watcher")
            .field("kind", &kind)
            .field("active", &self.state.active.get())
            .finish()
    }
}
