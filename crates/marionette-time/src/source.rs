//! Time sources
//!
//! Components never call `Instant::now()` directly; they ask a `TimeSource`.
//! Production uses the OS monotonic clock, tests drive a manual one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Monotonic clock capability supplied by the host
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
}

/// OS monotonic clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualTimeSource {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        ManualTimeSource {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock();
        *offset += by;
    }

    /// Jump to an absolute offset from the origin; never moves backwards
    pub fn set_elapsed(&self, elapsed: Duration) {
        let mut offset = self.offset.lock();
        if elapsed > *offset {
            *offset = elapsed;
        }
    }

    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}
