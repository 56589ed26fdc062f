//! Clock abstraction
//!
//! Time is an explicit dependency so that lease and recall bookkeeping can
//! be driven deterministically in tests.

use parking_lot::Mutex;
use std::time::{Duration, SystemTime};

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> SystemTime;
}

/// The system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A manually-advanced clock for tests
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    /// Create a clock pinned to `start`
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advance the clock
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}
