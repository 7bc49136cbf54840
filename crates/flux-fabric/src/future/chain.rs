//! Future chaining: `and_then` / `or_then` composition.
//!
//! `and_then` returns a composite future fulfilled by a continuation that
//! runs when the inner future succeeds; `or_then` attaches the failure-side
//! continuation to the same composite. Inside either continuation,
//! [`Future::continue_with`] forwards a freshly started future's eventual
//! result into the composite, and [`Future::continue_error`] fails it
//! directly. With neither callback applicable, the inner result is adopted
//! into the composite as-is.
//!
//! Context propagates down the chain: blocking on the composite drives the
//! inner futures on the composite's private reactor and cloned handle, so
//! a chain of RPCs resolves from a single `get`.
use std::cell::RefCell;
use std::rc::Rc;

use crate::errno::Errno;
use crate::future::{ContinuationFn, Future, WeakFuture};

pub(crate) struct ChainState {
    /// The composite future, not owned: the chain dissolves if the caller
    /// lets it go.
    next: WeakFuture,
    and_cb: RefCell<Option<ContinuationFn>>,
    or_cb: RefCell<Option<ContinuationFn>>,
}

impl Future {
    /// The chain on `self`, created on first use together with its
    /// composite future.
    fn chain(&self) -> (Rc<ChainState>, Future) {
        if let Some(state) = &*self.inner.chain.borrow() {
            if let Some(next) = state.next.upgrade() {
                return (state.clone(), next);
            }
        }
        let prev = self.clone();
        let composite = Future::with_init(move |composite| {
            // Push the composite's context (reactor, and the handle clone
            // when blocking) down to the inner future, then arm the
            // trampoline.
            if let Ok(r) = composite.reactor() {
                prev.set_reactor(&r);
            }
            if let Ok(h) = composite.handle() {
                if prev.set_handle(&h).is_err() {
                    return;
                }
            }
            if let Err(e) = prev.then(None, |f| f.chain_trampoline()) {
                composite.fatal_error(e, Some("error setting up future chain".into()));
            }
        });
        // The composite inherits the inner future's context so a bare
        // `then` on it lands on the right reactor.
        if let Some(r) = self.inner.reactor.borrow().as_ref() {
            composite.set_reactor(r);
        }
        if let Some(h) = self.inner.handle.borrow().clone() {
            let _ = composite.set_handle(&h);
        }
        let state = Rc::new(ChainState {
            next: composite.downgrade(),
            and_cb: RefCell::new(None),
            or_cb: RefCell::new(None),
        });
        *self.inner.chain.borrow_mut() = Some(state.clone());
        (state, composite)
    }

    /// Compose: when `self` succeeds, `cb` runs and forwards a result into
    /// the returned composite future (via [`Future::continue_with`] or
    /// [`Future::continue_error`]). Failure propagates directly unless an
    /// `or_then` callback is attached.
    pub fn and_then(&self, cb: impl FnMut(&Future) + 'static) -> Future {
        let (state, composite) = self.chain();
        *state.and_cb.borrow_mut() = Some(Box::new(cb));
        composite
    }

    /// Compose on the failure side: `cb` runs when `self` fails, instead of
    /// propagating the error into the composite.
    pub fn or_then(&self, cb: impl FnMut(&Future) + 'static) -> Future {
        let (state, composite) = self.chain();
        *state.or_cb.borrow_mut() = Some(Box::new(cb));
        composite
    }

    /// Trampoline continuation on the inner future.
    fn chain_trampoline(&self) {
        let Some(state) = self.inner.chain.borrow().clone() else {
            return;
        };
        let failed = self.has_error();
        let cb_slot = if failed { &state.or_cb } else { &state.and_cb };
        let mut cb = cb_slot.borrow_mut().take();
        match cb.as_mut() {
            Some(cb) => {
                cb(self);
            }
            None => {
                // No callback on this side: adopt the result into the
                // composite directly.
                if let Some(next) = state.next.upgrade() {
                    if let Err(e) = next.fulfill_with(self) {
                        next.fatal_error(e, Some("error propagating chained result".into()));
                    }
                }
            }
        }
        if let Some(cb) = cb {
            let mut slot = cb_slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    /// From inside a chain continuation: forward `next`'s eventual result
    /// into the composite future.
    pub fn continue_with(&self, next: &Future) -> Result<(), Errno> {
        let state = self.inner.chain.borrow().clone().ok_or(Errno::EINVAL)?;
        let Some(composite) = state.next.upgrade() else {
            return Ok(()); // composite was dropped; nothing to fulfill
        };
        next.set_reactor(&self.reactor()?);
        if let Ok(h) = self.handle() {
            next.set_handle(&h)?;
        }
        let weak = composite.downgrade();
        next.then(None, move |f| {
            if let Some(composite) = weak.upgrade() {
                if let Err(e) = composite.fulfill_with(f) {
                    composite.fatal_error(e, Some("error adopting continued result".into()));
                }
            }
        })?;
        // Keep the continued future alive until its result lands.
        self.aux_append(next.clone());
        Ok(())
    }

    /// From inside a chain continuation: fail the composite future.
    pub fn continue_error(&self, errno: Errno, errstr: Option<String>) {
        if let Some(state) = self.inner.chain.borrow().clone() {
            if let Some(composite) = state.next.upgrade() {
                composite.fulfill_error(errno, errstr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, RunFlags};
    use crate::watcher::Watcher;
    use std::cell::Cell;
    use std::time::Duration;

    /// A future fulfilled with `n + 1` by a timer on the context reactor, a
    /// stand-in for an asynchronous increment service.
    fn incr(n: i32) -> Future {
        Future::with_init(move |f| {
            let Ok(r) = f.reactor() else {
                f.fulfill_error(Errno::EINVAL, None);
                return;
            };
            let weak = f.downgrade();
            let w = Watcher::timer(&r, Duration::from_millis(1), Duration::ZERO, {
                move |_, _, _| {
                    if let Some(f) = weak.upgrade() {
                        f.fulfill(n + 1);
                    }
                }
            });
            w.start();
            f.aux_append(w);
        })
    }

    fn incr_step(f: &Future) {
        let n = match f.get_as::<i32>() {
            Ok(n) => *n,
            Err(e) => {
                f.continue_error(e, None);
                return;
            }
        };
        let next = incr(n);
        if let Err(e) = f.continue_with(&next) {
            f.continue_error(e, None);
        }
    }

    #[test]
    fn test_chained_now() {
        // Three chained increments resolved by one blocking get.
        let f = incr(0).and_then(incr_step).and_then(incr_step);
        assert_eq!(*f.get_as::<i32>().unwrap(), 3);
    }

    #[test]
    fn test_chained_then() {
        let r = Reactor::new().unwrap();
        let f = incr(0);
        f.set_reactor(&r);
        let f3 = f.and_then(incr_step).and_then(incr_step);

        let got = Rc::new(Cell::new(0));
        f3.then(None, {
            let got = got.clone();
            move |f| got.set(*f.get_as::<i32>().unwrap())
        })
        .unwrap();

        assert_eq!(r.run(RunFlags::Default).unwrap(), 0);
        assert_eq!(got.get(), 3);
    }

    #[test]
    fn test_error_propagates_without_or_then() {
        let failing = Future::with_init(|f| {
            f.fulfill_error(Errno::EPROTO, None);
        });
        let f = failing.and_then(incr_step);
        assert_eq!(f.get().unwrap_err(), Errno::EPROTO);
    }

    #[test]
    fn test_or_then_intercepts_error() {
        let failing = Future::with_init(|f| {
            f.fulfill_error(Errno::EPROTO, None);
        });
        let and_ran = Rc::new(Cell::new(false));
        let f = failing.and_then({
            let and_ran = and_ran.clone();
            move |_| and_ran.set(true)
        });
        // or_then attaches to the same composite.
        failing.or_then(|f| {
            let e = f.error().expect("failed future has an error");
            f.continue_error(e, Some("handled downstream".into()));
        });

        assert_eq!(f.get().unwrap_err(), Errno::EPROTO);
        assert_eq!(f.error_string().as_deref(), Some("handled downstream"));
        assert!(!and_ran.get(), "and_then side was skipped");
    }

    #[test]
    fn test_continue_without_chain_is_einval() {
        let f = Future::new();
        let g = Future::new();
        assert_eq!(f.continue_with(&g), Err(Errno::EINVAL));
    }
}
