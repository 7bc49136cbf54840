//! Manages timer deadlines and triggers timeouts.
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// A registered deadline, used to cancel or re-arm it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey(Instant, u64);

impl TimerKey {
    /// The absolute deadline this key was registered for.
    pub fn deadline(&self) -> Instant {
        self.0
    }
}

/// Monotonic-clock timer wheel mapping deadlines to watcher ids.
#[derive(Debug, Default)]
pub struct Timer {
    timeouts: BTreeMap<(Instant, u64), u64>,
    seq: u64,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deadline for a watcher, returning a cancellation key.
    pub fn set_deadline(&mut self, deadline: Instant, watcher: u64) -> TimerKey {
        self.seq += 1;
        self.timeouts.insert((deadline, self.seq), watcher);
        TimerKey(deadline, self.seq)
    }

    /// Register a timeout relative to `after`.
    pub fn set_timeout(&mut self, timeout: Duration, after: Instant, watcher: u64) -> TimerKey {
        self.set_deadline(after + timeout, watcher)
    }

    /// Cancel a previously registered deadline.
    pub fn cancel(&mut self, key: TimerKey) {
        self.timeouts.remove(&(key.0, key.1));
    }

    /// Get the first timeout expiring right at or after a certain moment.
    /// Returns [`None`] if there are no timeouts.
    pub fn next_expiring_from(&self, time: Instant) -> Option<Duration> {
        let ((deadline, _), _) = self.timeouts.first_key_value()?;
        Some(if *deadline >= time {
            *deadline - time
        } else {
            Duration::default()
        })
    }

    /// Remove deadlines that expire by `instant` (inclusive), returning the
    /// watchers they belong to.
    pub fn remove_expired_by(&mut self, instant: Instant) -> Vec<u64> {
        // `split_off` returns everything at or after the key; nudge the key
        // past `instant` so deadlines landing exactly on it expire too.
        let at = (instant + Duration::from_millis(1), 0);
        let unexpired = self.timeouts.split_off(&at);
        let fired = std::mem::replace(&mut self.timeouts, unexpired);
        fired.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.timeouts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_exact() {
        let mut tm = Timer::new();

        let now = Instant::now();
        tm.set_timeout(Duration::from_secs(8), now, 1);
        tm.set_timeout(Duration::from_secs(9), now, 2);
        tm.set_timeout(Duration::from_secs(10), now, 3);

        let fired = tm.remove_expired_by(now + Duration::from_secs(9));
        assert_eq!(fired, vec![1, 2]);
        assert!(!tm.is_empty());
    }

    #[test]
    fn test_wake() {
        let mut tm = Timer::new();

        let now = Instant::now();
        tm.set_timeout(Duration::from_secs(8), now, 1);
        tm.set_timeout(Duration::from_secs(16), now, 2);
        tm.set_timeout(Duration::from_secs(64), now, 3);
        tm.set_timeout(Duration::from_secs(72), now, 4);

        assert_eq!(tm.remove_expired_by(now).len(), 0);
        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(9)), vec![1]);
        assert_eq!(
            tm.remove_expired_by(now + Duration::from_secs(66)),
            vec![2, 3]
        );
        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(96)), vec![4]);
        assert!(tm.is_empty());
    }

    #[test]
    fn test_next() {
        let mut tm = Timer::new();

        let mut now = Instant::now();
        tm.set_timeout(Duration::from_secs(3), now, 1);
        assert_eq!(tm.next_expiring_from(now), Some(Duration::from_secs(3)));

        now += Duration::from_secs(2);
        assert_eq!(tm.next_expiring_from(now), Some(Duration::from_secs(1)));

        now += Duration::from_secs(1);
        assert_eq!(tm.next_expiring_from(now), Some(Duration::from_secs(0)));

        assert_eq!(tm.remove_expired_by(now), vec![1]);
        assert_eq!(tm.next_expiring_from(now), None);
    }

    #[test]
    fn test_cancel() {
        let mut tm = Timer::new();
        let now = Instant::now();
        let key = tm.set_timeout(Duration::from_secs(1), now, 1);
        tm.cancel(key);
        assert!(tm.is_empty());
        assert_eq!(tm.remove_expired_by(now + Duration::from_secs(2)).len(), 0);
    }

    #[test]
    fn test_equal_deadlines_coexist() {
        let mut tm = Timer::new();
        let now = Instant::now();
        let deadline = now + Duration::from_secs(1);
        tm.set_deadline(deadline, 1);
        tm.set_deadline(deadline, 2);

        let fired = tm.remove_expired_by(deadline);
        assert_eq!(fired.len(), 2);
    }
}
