//! Poll event bitsets.
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// A set of readiness conditions, in the style of `poll(2)` events.
///
/// Used both for connector/deque readiness sampling (edge-triggered) and for
/// the event masks reported to watcher callbacks.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PollEvents(u32);

impl PollEvents {
    /// Nothing ready.
    pub const NONE: PollEvents = PollEvents(0);
    /// Readable: messages may be popped, or the descriptor is readable.
    pub const IN: PollEvents = PollEvents(1);
    /// Writable: messages may be pushed, or the descriptor is writable.
    pub const OUT: PollEvents = PollEvents(2);
    /// Error condition.
    pub const ERR: PollEvents = PollEvents(4);

    /// True if no condition is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// True if every condition in `other` is set in `self`.
    pub fn contains(&self, other: PollEvents) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any condition in `other` is set in `self`.
    pub fn intersects(&self, other: PollEvents) -> bool {
        self.0 & other.0 != 0
    }

    /// Remove the conditions in `other`.
    pub fn remove(&mut self, other: PollEvents) {
        self.0 &= !other.0;
    }
}

impl BitOr for PollEvents {
    type Output = PollEvents;

    fn bitor(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for PollEvents {
    fn bitor_assign(&mut self, rhs: PollEvents) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for PollEvents {
    type Output = PollEvents;

    fn bitand(self, rhs: PollEvents) -> PollEvents {
        PollEvents(self.0 & rhs.0)
    }
}

impl fmt::Display for PollEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Self::IN) {
            parts.push("IN");
        }
        if self.contains(Self::OUT) {
            parts.push("OUT");
        }
        if self.contains(Self::ERR) {
            parts.push("ERR");
        }
        if parts.is_empty() {
            write!(f, "-")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}
