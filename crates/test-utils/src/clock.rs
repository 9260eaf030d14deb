//! Hand-driven clock for lease tests.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use keel_types::Clock;
use parking_lot::Mutex;

/// A [`Clock`] that only moves when told to.
///
/// Clones share the same instant, so a test can keep one handle and give
/// another to the state under test.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use keel_test_utils::ManualClock;
/// use keel_types::Clock;
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(10));
/// assert_eq!((clock.now() - start).num_seconds(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock fixed at 2020-01-01T00:00:00Z.
    #[must_use]
    pub fn new() -> Self {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap_or_default();
        Self::starting_at(start)
    }

    /// Creates a clock fixed at `start`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(*now);
    }

    /// Sets the clock to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock() = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
