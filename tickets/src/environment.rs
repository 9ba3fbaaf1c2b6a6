//! Ticket environment.
//!
//! Time is injected rather than read from the system so expiration logic can
//! be driven deterministically in tests.

use chrono::{DateTime, Utc};

/// Clock trait - abstracts time operations for testability.
///
/// # Examples
///
/// ```
/// use sso_tickets::environment::{Clock, SystemClock};
///
/// let clock = SystemClock;
/// let first = clock.now();
/// assert!(clock.now() >= first);
/// ```
pub trait Clock: Send + Sync {
    /// Get the current time.
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
