//! Deterministic clocks.

use crate::environment::Clock;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

/// 2025-01-01T00:00:00Z, in milliseconds since the Unix epoch.
const TEST_EPOCH_MILLIS: i64 = 1_735_689_600_000;

/// Fixed clock for deterministic tests.
///
/// Always returns the same time.
///
/// # Example
///
/// ```
/// use sso_tickets::environment::Clock;
/// use sso_tickets::mocks::FixedClock;
///
/// let clock = FixedClock::at_epoch();
/// assert_eq!(clock.now(), clock.now());
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FixedClock {
    time: DateTime<Utc>,
}

impl FixedClock {
    /// Create a clock frozen at `time`.
    #[must_use]
    pub const fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }

    /// Create a clock frozen at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn at_epoch() -> Self {
        Self::new(epoch())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}

/// Clock that only moves when told to.
///
/// Clones share the same time, so a test can keep a handle and advance the
/// clock seen by a registry or factory.
#[derive(Debug, Clone)]
pub struct ManualClock {
    millis: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(time.timestamp_millis())),
        }
    }

    /// Create a clock starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn at_epoch() -> Self {
        Self::new(epoch())
    }

    /// Move the clock by `delta` (may be negative).
    pub fn advance(&self, delta: TimeDelta) {
        self.millis.fetch_add(delta.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jump to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(TEST_EPOCH_MILLIS).unwrap_or_default()
}
