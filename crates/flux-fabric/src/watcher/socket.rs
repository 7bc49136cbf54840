//! Aggregate watcher for edge-triggered event sources.
//!
//! Transports in the 0MQ style expose a readiness descriptor that edge
//! triggers when a sampled events mask *may* have changed, rather than a
//! descriptor that is itself readable/writable. Integrating one with the
//! reactor takes four inner watchers:
//!
//! * a **prepare** watcher samples the events mask before the loop blocks;
//!   if any bit of interest is asserted it starts a no-op **idle** watcher
//!   (so the loop keeps spinning), otherwise it starts an **fd** watcher on
//!   the readiness descriptor (so the loop unblocks on the next edge);
//! * a **check** watcher stops both, re-samples, and fires the user
//!   callback with the asserted bits.
//!
//! The message-handle watcher is the same pattern over a handle's aggregate
//! descriptor (see [`crate::watcher::handle`]).
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::reactor::Reactor;
use crate::watcher::{CompositeOps, Watcher, WatcherState};

/// An event source sampled through a readiness fd plus an events mask.
pub trait PollSource {
    /// Descriptor that edge-triggers readable when [`PollSource::pollevents`]
    /// may have changed.
    fn pollfd(&self) -> Result<RawFd, Errno>;

    /// Sample the current events mask.
    fn pollevents(&self) -> Result<PollEvents, Errno>;
}

pub(crate) struct Aggregate {
    source: Rc<dyn PollSource>,
    /// User interest, with `ERR` always included.
    events: PollEvents,
    outer: RefCell<Weak<WatcherState>>,
    prepare: RefCell<Option<Watcher>>,
    check: RefCell<Option<Watcher>>,
    idle: RefCell<Option<Watcher>>,
    fd: RefCell<Option<Watcher>>,
}

impl Aggregate {
    fn sample(&self) -> PollEvents {
        self.source.pollevents().unwrap_or(PollEvents::ERR)
    }

    fn with_inner(&self, f: impl Fn(&Watcher)) {
        for slot in [&self.prepare, &self.check, &self.idle, &self.fd] {
            if let Some(w) = &*slot.borrow() {
                f(w);
            }
        }
    }

    fn call_outer(&self, reactor: &Reactor, revents: PollEvents) {
        if let Some(state) = self.outer.borrow().upgrade() {
            let w = Watcher::from_state(state.clone());
            let mut cb = state.cb.borrow_mut();
            if let Some(cb) = cb.as_mut() {
                cb(reactor, &w, revents);
            }
        }
    }
}

impl CompositeOps for Aggregate {
    fn start(&self) {
        if let Some(w) = &*self.prepare.borrow() {
            w.start();
        }
        if let Some(w) = &*self.check.borrow() {
            w.start();
        }
    }

    fn stop(&self) {
        self.with_inner(Watcher::stop);
    }

    fn is_active(&self) -> bool {
        self.prepare
            .borrow()
            .as_ref()
            .map(Watcher::is_active)
            .unwrap_or(false)
    }

    fn set_ref(&self, on: bool) {
        self.with_inner(|w| if on { w.ref_() } else { w.unref() });
    }
}

impl Watcher {
    /// Watch an edge-triggered [`PollSource`] for `events`.
    pub fn socket(
        reactor: &Reactor,
        source: Rc<dyn PollSource>,
        events: PollEvents,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Result<Watcher, Errno> {
        let agg = Rc::new(Aggregate {
            source: source.clone(),
            events: events | PollEvents::ERR,
            outer: RefCell::new(Weak::new()),
            prepare: RefCell::new(None),
            check: RefCell::new(None),
            idle: RefCell::new(None),
            fd: RefCell::new(None),
        });
        let outer = Watcher::composite(reactor, agg.clone(), Some(Box::new(cb)));
        *agg.outer.borrow_mut() = Rc::downgrade(outer.state());

        let prepare = Watcher::prepare(reactor, {
            let agg = Rc::downgrade(&agg);
            move |_, _, _| {
                let Some(agg) = agg.upgrade() else { return };
                let ready = agg.sample().intersects(agg.events);
                if ready {
                    if let Some(idle) = &*agg.idle.borrow() {
                        idle.start();
                    }
                } else if let Some(fd) = &*agg.fd.borrow() {
                    fd.start();
                }
            }
        });
        let check = Watcher::check(reactor, {
            let agg = Rc::downgrade(&agg);
            move |reactor, _, _| {
                let Some(agg) = agg.upgrade() else { return };
                if let Some(fd) = &*agg.fd.borrow() {
                    fd.stop();
                }
                if let Some(idle) = &*agg.idle.borrow() {
                    idle.stop();
                }
                let revents = agg.sample() & agg.events;
                if !revents.is_empty() {
                    agg.call_outer(reactor, revents);
                }
            }
        });
        let idle = Watcher::idle_noop(reactor);
        // The inner fd watcher exists to unblock the loop on the readiness
        // edge; only an error condition is forwarded.
        let fd = Watcher::fd(reactor, source.pollfd()?, PollEvents::IN, {
            let agg = Rc::downgrade(&agg);
            move |reactor, _, revents| {
                if revents.contains(PollEvents::ERR) {
                    if let Some(agg) = agg.upgrade() {
                        agg.call_outer(reactor, PollEvents::ERR);
                    }
                }
            }
        });

        *agg.prepare.borrow_mut() = Some(prepare);
        *agg.check.borrow_mut() = Some(check);
        *agg.idle.borrow_mut() = Some(idle);
        *agg.fd.borrow_mut() = Some(fd);
        Ok(outer)
    }
}
