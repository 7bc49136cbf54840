//! Reactor watcher for message handles.
//!
//! A handle's aggregate pollfd is edge-triggered over the connector and
//! re-queue descriptors, so it is integrated with the reactor via the same
//! aggregate pattern as any sampled transport (see
//! [`crate::watcher::socket`]). The dispatcher drives this watcher to
//! deliver at most one message per loop iteration.
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::errno::Errno;
use crate::events::PollEvents;
use crate::handle::{Handle, WeakHandle};
use crate::reactor::Reactor;
use crate::watcher::socket::PollSource;
use crate::watcher::Watcher;

struct HandleSource {
    handle: WeakHandle,
}

impl PollSource for HandleSource {
    fn pollfd(&self) -> Result<RawFd, Errno> {
        let handle = self.handle.upgrade().ok_or(Errno::EINVAL)?;
        handle.pollfd()
    }

    fn pollevents(&self) -> Result<PollEvents, Errno> {
        let handle = self.handle.upgrade().ok_or(Errno::EINVAL)?;
        handle.pollevents()
    }
}

impl Watcher {
    /// Watch a handle for `events` readiness.
    pub fn handle_watcher(
        reactor: &Reactor,
        handle: &Handle,
        events: PollEvents,
        cb: impl FnMut(&Reactor, &Watcher, PollEvents) + 'static,
    ) -> Result<Watcher, Errno> {
        let source = Rc::new(HandleSource {
            handle: handle.downgrade(),
        });
        // Force creation of the aggregate pollfd now so failures surface
        // here rather than in the loop.
        handle.pollfd()?;
        Watcher::socket(reactor, source, events, cb)
    }
}
