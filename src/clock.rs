//! Wall-clock abstraction.
//!
//! Every component that reads the current time takes a [`Clock`] at
//! construction instead of calling `Utc::now()` directly. Production code
//! uses [`SystemClock`]; tests substitute [`FixedClock`] so rate windows,
//! retry due-times, and schedule promotion are deterministic.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

/// Provides the current wall-clock time.
pub trait Clock: Send + Sync {
    /// Returns the current time in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock that returns a programmable instant.
///
/// The time only moves when `advance` or `set` is called, which makes
/// time-driven behavior (window rollover, due retries) reproducible.
#[derive(Debug, Clone)]
pub struct FixedClock {
    time: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    /// Creates a clock frozen at the given instant.
    pub fn new(time: DateTime<Utc>) -> Self {
        FixedClock {
            time: Arc::new(std::sync::Mutex::new(time)),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut t = self.time.lock().expect("clock lock poisoned");
        *t += delta;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, time: DateTime<Utc>) {
        *self.time.lock().expect("clock lock poisoned") = time;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.time.lock().expect("clock lock poisoned")
    }
}
