//! One-shot deadlines
//!
//! Timers in the engine (reconnect backoff, signal debounce, decode
//! watchdogs) are plain values polled against injected time. Nothing
//! fires on its own; the owner checks `fire(now)` on each tick.

use std::time::{Duration, Instant};

/// A one-shot deadline
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// An unarmed deadline
    pub const fn disarmed() -> Self {
        Deadline { at: None }
    }

    /// Arm to expire `delay` after `now`, replacing any previous arming
    pub fn arm(&mut self, now: Instant, delay: Duration) {
        self.at = Some(now + delay);
    }

    pub fn arm_at(&mut self, at: Instant) {
        self.at = Some(at);
    }

    /// Arm only if that would make the deadline sooner
    pub fn arm_earliest(&mut self, at: Instant) {
        self.at = Some(match self.at {
            Some(current) => current.min(at),
            None => at,
        });
    }

    pub fn disarm(&mut self) {
        self.at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.at.is_some()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.at
    }

    /// Whether the deadline is armed and has passed
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.at, Some(at) if now >= at)
    }

    /// Time left until expiry; zero once due, `None` when unarmed
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(now))
    }

    /// Consume the deadline if due. Returns true exactly once per arming.
    pub fn fire(&mut self, now: Instant) -> bool {
        if self.is_due(now) {
            self.at = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_fires_once() {
        let t0 = Instant::now();
        let mut deadline = Deadline::disarmed();
        assert!(!deadline.fire(t0));

        deadline.arm(t0, Duration::from_millis(500));
        assert!(!deadline.fire(t0 + Duration::from_millis(499)));
        assert_eq!(
            deadline.remaining(t0 + Duration::from_millis(200)),
            Some(Duration::from_millis(300))
        );
        assert!(deadline.fire(t0 + Duration::from_millis(500)));
        assert!(!deadline.fire(t0 + Duration::from_secs(10)));
        assert!(!deadline.is_armed());
    }

    #[test]
    fn test_arm_earliest_keeps_sooner() {
        let t0 = Instant::now();
        let mut deadline = Deadline::default();
        deadline.arm_earliest(t0 + Duration::from_secs(4));
        deadline.arm_earliest(t0 + Duration::from_secs(8));
        assert_eq!(deadline.expires_at(), Some(t0 + Duration::from_secs(4)));
        deadline.arm_earliest(t0 + Duration::from_secs(1));
        assert_eq!(deadline.expires_at(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_rearm_replaces() {
        let t0 = Instant::now();
        let mut deadline = Deadline::default();
        deadline.arm(t0, Duration::from_secs(1));
        deadline.arm(t0, Duration::from_secs(3));
        assert!(!deadline.is_due(t0 + Duration::from_secs(2)));
        deadline.disarm();
        assert_eq!(deadline.remaining(t0), None);
    }
}
