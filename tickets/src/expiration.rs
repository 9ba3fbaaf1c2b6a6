//! Expiration policy engine.
//!
//! Every ticket embeds its own [`ExpirationPolicy`], so the same ticket type can
//! carry different lifetimes per relying party. Policies are immutable values
//! built with explicit parameters and evaluated as pure functions of the
//! ticket's usage and the current time.
//!
//! # Variants
//!
//! | Policy | Expires when |
//! |--------|--------------|
//! | `NeverExpires` | never (administrative override) |
//! | `AlwaysExpires` | always (administrative override) |
//! | `TimeToLive` | `now - created_at > ttl` |
//! | `TimeToIdle` | `now - last_used_at > tti` |
//! | `HardAndIdle` | either of the above |
//! | `MultiUseOrTimeout` | `use_count >= max_uses` or `now - created_at > ttl` |
//! | `Throttled` | as its inner policy; also caps children issued per window |
//! | `RememberMe` | as `remembered` if the login asked to be remembered, else `default` |
//! | `Sovereign` | as its inner policy; never expired by a governing ticket |

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Usage facts a policy is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketUsage {
    /// When the ticket was minted.
    pub created_at: DateTime<Utc>,
    /// Last recorded use (equals `created_at` until first use).
    pub last_used_at: DateTime<Utc>,
    /// Number of recorded uses.
    pub use_count: u32,
    /// Whether the authenticating user asked to be remembered.
    pub remember_me: bool,
}

impl TicketUsage {
    /// Usage of a ticket that has never been used.
    #[must_use]
    pub const fn fresh(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            last_used_at: created_at,
            use_count: 0,
            remember_me: false,
        }
    }
}

/// Expiration policy attached to a ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationPolicy {
    /// Ticket never expires on its own.
    NeverExpires,

    /// Ticket is expired from the moment it is minted.
    AlwaysExpires,

    /// Hard timeout measured from creation.
    TimeToLive {
        /// Maximum lifetime.
        time_to_live: Duration,
    },

    /// Sliding timeout measured from the last use.
    TimeToIdle {
        /// Maximum idle period.
        time_to_idle: Duration,
    },

    /// Hard timeout and sliding timeout combined; the more restrictive wins.
    HardAndIdle {
        /// Maximum lifetime.
        time_to_live: Duration,
        /// Maximum idle period.
        time_to_idle: Duration,
    },

    /// Limited number of uses within a short absolute lifetime.
    MultiUseOrTimeout {
        /// Uses allowed before the ticket is spent.
        max_uses: u32,
        /// Maximum lifetime.
        time_to_live: Duration,
    },

    /// Inner policy plus a cap on children issued per window.
    Throttled {
        /// Policy governing this ticket's own lifetime.
        inner: Box<ExpirationPolicy>,
        /// Children allowed within `window`.
        max_issued: u32,
        /// Sliding window the cap applies to.
        window: Duration,
    },

    /// Chooses between two policies by the login's remember-me choice.
    RememberMe {
        /// Policy used when the user asked to be remembered.
        remembered: Box<ExpirationPolicy>,
        /// Policy used otherwise.
        default: Box<ExpirationPolicy>,
    },

    /// Inner policy, exempt from cascade expiry and cascade deletion.
    Sovereign {
        /// Policy governing this ticket's own lifetime.
        inner: Box<ExpirationPolicy>,
    },
}

impl ExpirationPolicy {
    /// Hard timeout policy.
    #[must_use]
    pub const fn time_to_live(time_to_live: Duration) -> Self {
        Self::TimeToLive { time_to_live }
    }

    /// Sliding timeout policy.
    #[must_use]
    pub const fn time_to_idle(time_to_idle: Duration) -> Self {
        Self::TimeToIdle { time_to_idle }
    }

    /// Combined hard and sliding timeout, as used by ticket-granting tickets.
    #[must_use]
    pub const fn hard_and_idle(time_to_live: Duration, time_to_idle: Duration) -> Self {
        Self::HardAndIdle {
            time_to_live,
            time_to_idle,
        }
    }

    /// Use-count limited policy with an absolute timeout.
    #[must_use]
    pub const fn multi_use_or_timeout(max_uses: u32, time_to_live: Duration) -> Self {
        Self::MultiUseOrTimeout {
            max_uses,
            time_to_live,
        }
    }

    /// Single presentation within `time_to_live`.
    #[must_use]
    pub const fn single_use(time_to_live: Duration) -> Self {
        Self::multi_use_or_timeout(1, time_to_live)
    }

    /// Wrap `self` with a cap of `max_issued` children per `window`.
    #[must_use]
    pub fn throttled(self, max_issued: u32, window: Duration) -> Self {
        Self::Throttled {
            inner: Box::new(self),
            max_issued,
            window,
        }
    }

    /// Use `remembered` for remember-me logins and `self` otherwise.
    #[must_use]
    pub fn with_remember_me(self, remembered: Self) -> Self {
        Self::RememberMe {
            remembered: Box::new(remembered),
            default: Box::new(self),
        }
    }

    /// Exempt `self` from cascade expiry.
    #[must_use]
    pub fn sovereign(self) -> Self {
        Self::Sovereign {
            inner: Box::new(self),
        }
    }

    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NeverExpires => "never_expires",
            Self::AlwaysExpires => "always_expires",
            Self::TimeToLive { .. } => "time_to_live",
            Self::TimeToIdle { .. } => "time_to_idle",
            Self::HardAndIdle { .. } => "hard_and_idle",
            Self::MultiUseOrTimeout { .. } => "multi_use_or_timeout",
            Self::Throttled { .. } => "throttled",
            Self::RememberMe { .. } => "remember_me",
            Self::Sovereign { .. } => "sovereign",
        }
    }

    /// The policy actually in force for this usage (unwraps remember-me).
    fn effective(&self, usage: &TicketUsage) -> &Self {
        match self {
            Self::RememberMe {
                remembered,
                default,
            } => {
                if usage.remember_me {
                    remembered.effective(usage)
                } else {
                    default.effective(usage)
                }
            }
            Self::Throttled { inner, .. } | Self::Sovereign { inner } => inner.effective(usage),
            other => other,
        }
    }

    /// Hard lifetime, if the policy has one.
    #[must_use]
    pub fn time_to_live_limit(&self) -> Option<Duration> {
        match self {
            Self::TimeToLive { time_to_live }
            | Self::HardAndIdle { time_to_live, .. }
            | Self::MultiUseOrTimeout { time_to_live, .. } => Some(*time_to_live),
            Self::Throttled { inner, .. } | Self::Sovereign { inner } => inner.time_to_live_limit(),
            Self::RememberMe { default, .. } => default.time_to_live_limit(),
            Self::AlwaysExpires => Some(Duration::ZERO),
            Self::NeverExpires | Self::TimeToIdle { .. } => None,
        }
    }

    /// Idle limit, if the policy has one.
    #[must_use]
    pub fn time_to_idle_limit(&self) -> Option<Duration> {
        match self {
            Self::TimeToIdle { time_to_idle } | Self::HardAndIdle { time_to_idle, .. } => {
                Some(*time_to_idle)
            }
            Self::Throttled { inner, .. } | Self::Sovereign { inner } => inner.time_to_idle_limit(),
            Self::RememberMe { default, .. } => default.time_to_idle_limit(),
            _ => None,
        }
    }

    /// Use limit, if the policy has one.
    #[must_use]
    pub fn max_uses(&self) -> Option<u32> {
        match self {
            Self::MultiUseOrTimeout { max_uses, .. } => Some(*max_uses),
            Self::Throttled { inner, .. } | Self::Sovereign { inner } => inner.max_uses(),
            Self::RememberMe { default, .. } => default.max_uses(),
            _ => None,
        }
    }

    /// Whether the ticket is expired at `now` according to this policy alone.
    #[must_use]
    pub fn is_expired(&self, usage: &TicketUsage, now: DateTime<Utc>) -> bool {
        match self.effective(usage) {
            Self::NeverExpires => false,
            Self::AlwaysExpires => true,
            Self::TimeToLive { time_to_live } => exceeds(now - usage.created_at, *time_to_live),
            Self::TimeToIdle { time_to_idle } => exceeds(now - usage.last_used_at, *time_to_idle),
            Self::HardAndIdle {
                time_to_live,
                time_to_idle,
            } => {
                exceeds(now - usage.created_at, *time_to_live)
                    || exceeds(now - usage.last_used_at, *time_to_idle)
            }
            Self::MultiUseOrTimeout {
                max_uses,
                time_to_live,
            } => usage.use_count >= *max_uses || exceeds(now - usage.created_at, *time_to_live),
            // `effective` never returns a wrapper.
            Self::Throttled { .. } | Self::RememberMe { .. } | Self::Sovereign { .. } => true,
        }
    }

    /// Whether recording a use changes anything this policy looks at.
    #[must_use]
    pub fn tracks_use(&self) -> bool {
        match self {
            Self::NeverExpires | Self::AlwaysExpires | Self::TimeToLive { .. } => false,
            Self::TimeToIdle { .. } | Self::HardAndIdle { .. } | Self::MultiUseOrTimeout { .. } => {
                true
            }
            Self::Throttled { inner, .. } | Self::Sovereign { inner } => inner.tracks_use(),
            Self::RememberMe {
                remembered,
                default,
            } => remembered.tracks_use() || default.tracks_use(),
        }
    }

    /// The branch of a remember-me policy that applies to this usage.
    fn chosen(&self, usage: &TicketUsage) -> &Self {
        match self {
            Self::RememberMe {
                remembered,
                default,
            } => {
                if usage.remember_me {
                    remembered.chosen(usage)
                } else {
                    default.chosen(usage)
                }
            }
            other => other,
        }
    }

    /// Whether tickets under this policy outlive their governing ticket.
    #[must_use]
    pub fn ignores_cascade(&self, usage: &TicketUsage) -> bool {
        match self.chosen(usage) {
            Self::Sovereign { .. } => true,
            Self::Throttled { inner, .. } => inner.ignores_cascade(usage),
            _ => false,
        }
    }

    /// Cap on children issued per window, as `(max_issued, window)`.
    #[must_use]
    pub fn issuance_limit(&self, usage: &TicketUsage) -> Option<(u32, Duration)> {
        match self.chosen(usage) {
            Self::Throttled {
                max_issued, window, ..
            } => Some((*max_issued, *window)),
            Self::Sovereign { inner } => inner.issuance_limit(usage),
            _ => None,
        }
    }

    /// Time until another child may be issued, or `None` if issuance is allowed.
    ///
    /// `issued` yields the issue times of children already minted.
    #[must_use]
    pub fn issuance_retry_after<I>(
        &self,
        usage: &TicketUsage,
        issued: I,
        now: DateTime<Utc>,
    ) -> Option<Duration>
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let (max_issued, window) = self.issuance_limit(usage)?;
        let window_delta = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let window_start = now.checked_sub_signed(window_delta)?;

        let mut recent: Vec<DateTime<Utc>> =
            issued.into_iter().filter(|at| *at > window_start).collect();
        if recent.len() < max_issued as usize {
            return None;
        }

        recent.sort_unstable();
        let oldest = recent.first().copied().unwrap_or(now);
        Some(remaining(window, oldest, now).max(Duration::from_millis(1)))
    }

    /// Upper bound on the remaining lifetime, used as a backend TTL hint.
    ///
    /// Never shorter than the lifetime the policy grants, so a backend honouring
    /// the hint cannot evict a ticket early. `None` means "no bound".
    #[must_use]
    pub fn storage_ttl(&self, usage: &TicketUsage, now: DateTime<Utc>) -> Option<Duration> {
        match self.effective(usage) {
            Self::NeverExpires => None,
            Self::AlwaysExpires => Some(Duration::ZERO),
            Self::TimeToLive { time_to_live }
            | Self::MultiUseOrTimeout { time_to_live, .. } => {
                Some(remaining(*time_to_live, usage.created_at, now))
            }
            Self::TimeToIdle { time_to_idle } => {
                Some(remaining(*time_to_idle, usage.last_used_at, now))
            }
            Self::HardAndIdle {
                time_to_live,
                time_to_idle,
            } => Some(
                remaining(*time_to_live, usage.created_at, now)
                    .min(remaining(*time_to_idle, usage.last_used_at, now)),
            ),
            Self::Throttled { .. } | Self::RememberMe { .. } | Self::Sovereign { .. } => None,
        }
    }
}

/// `elapsed > limit`, treating limits beyond the `TimeDelta` range as unbounded.
fn exceeds(elapsed: TimeDelta, limit: Duration) -> bool {
    TimeDelta::from_std(limit).is_ok_and(|limit| elapsed > limit)
}

/// `limit - (now - since)`, saturating at zero.
fn remaining(limit: Duration, since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    limit.saturating_sub(elapsed)
}
