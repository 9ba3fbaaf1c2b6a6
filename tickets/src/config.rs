//! Ticket engine configuration.
//!
//! Configuration values are provided by the embedding application; nothing in
//! the engine reads ambient or global settings. Every struct has a `Default`
//! and `with_*` builders.

use crate::constants::MIN_RANDOM_BYTES;
use crate::error::{Result, TicketError};
use crate::expiration::ExpirationPolicy;
use crate::ticket::{Service, TicketKind};
use std::collections::HashMap;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Ticket ID generation configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdGeneratorConfig {
    /// Random bytes per ID.
    ///
    /// Default: 32 (256 bits). Minimum: 16 (128 bits).
    pub random_bytes: usize,

    /// Optional node tag appended to every ID (e.g. the host name).
    pub node_suffix: Option<String>,
}

impl IdGeneratorConfig {
    /// Set the number of random bytes per ID.
    #[must_use]
    pub const fn with_random_bytes(mut self, random_bytes: usize) -> Self {
        self.random_bytes = random_bytes;
        self
    }

    /// Set the node suffix.
    #[must_use]
    pub fn with_node_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.node_suffix = Some(suffix.into());
        self
    }

    /// Check the configuration.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::InvalidConfiguration` if fewer than 16 random
    /// bytes are configured or the suffix is empty or not URL-safe.
    pub fn validate(&self) -> Result<()> {
        if self.random_bytes < MIN_RANDOM_BYTES {
            return Err(TicketError::InvalidConfiguration(format!(
                "ticket IDs need at least {MIN_RANDOM_BYTES} random bytes, got {}",
                self.random_bytes
            )));
        }

        if let Some(suffix) = &self.node_suffix {
            let url_safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
            if suffix.is_empty() || !suffix.chars().all(url_safe) {
                return Err(TicketError::InvalidConfiguration(format!(
                    "node suffix {suffix:?} must be non-empty and URL-safe"
                )));
            }
        }

        Ok(())
    }
}

impl Default for IdGeneratorConfig {
    fn default() -> Self {
        Self {
            random_bytes: 32,
            node_suffix: None,
        }
    }
}

/// Ticket registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Upper bound on every backend call; exceeding it reports the registry
    /// as unavailable.
    ///
    /// Default: 5 seconds
    pub operation_timeout: Duration,

    /// How long a consumed single-use ticket is remembered, so replays are
    /// reported as already consumed rather than not found.
    ///
    /// Default: 5 minutes
    pub consumed_marker_ttl: Duration,

    /// Maximum number of ancestors resolved when checking cascade expiry.
    ///
    /// Default: 8
    pub max_chain_depth: usize,

    /// How often a conditional ticket write is retried after losing a race
    /// with another writer before the registry gives up.
    ///
    /// Default: 100
    pub max_write_retries: u32,
}

impl RegistryConfig {
    /// Create registry configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            operation_timeout: Duration::from_secs(5),
            consumed_marker_ttl: Duration::from_secs(5 * MINUTE),
            max_chain_depth: 8,
            max_write_retries: 100,
        }
    }

    /// Set the per-operation timeout.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set how long consumed markers live.
    #[must_use]
    pub const fn with_consumed_marker_ttl(mut self, ttl: Duration) -> Self {
        self.consumed_marker_ttl = ttl;
        self
    }

    /// Set the maximum resolved chain depth.
    #[must_use]
    pub const fn with_max_chain_depth(mut self, depth: usize) -> Self {
        self.max_chain_depth = depth;
        self
    }

    /// Set how often a contended write is retried.
    #[must_use]
    pub const fn with_max_write_retries(mut self, retries: u32) -> Self {
        self.max_write_retries = retries;
        self
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepConfig {
    /// Whether the sweeper runs at all.
    pub enabled: bool,

    /// Delay before the first sweep.
    ///
    /// Default: 15 seconds
    pub start_delay: Duration,

    /// Time between sweeps.
    ///
    /// Default: 2 minutes
    pub interval: Duration,
}

impl SweepConfig {
    /// Create sweep configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            start_delay: Duration::from_secs(15),
            interval: Duration::from_secs(2 * MINUTE),
        }
    }

    /// Enable or disable sweeping.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the delay before the first sweep.
    #[must_use]
    pub const fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Set the time between sweeps.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Expiration policies handed to new tickets.
///
/// Holds one default policy per ticket kind and optional per-service
/// overrides, so one ticket type can live longer for one relying party than
/// for another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPolicies {
    defaults: HashMap<TicketKind, ExpirationPolicy>,
    per_service: HashMap<(Service, TicketKind), ExpirationPolicy>,
    refresh_tokens_sovereign: bool,
}

impl TicketPolicies {
    /// Policies with the customary lifetimes:
    ///
    /// | Kind | Policy |
    /// |------|--------|
    /// | TGT, PGT | 8 hours hard, 2 hours idle |
    /// | ST, PT | 1 use within 10 seconds |
    /// | OAuth code | 1 use within 30 seconds |
    /// | Access token | 8 hours hard, 2 hours idle |
    /// | Refresh token | 30 days hard |
    #[must_use]
    pub fn new() -> Self {
        let granting =
            ExpirationPolicy::hard_and_idle(Duration::from_secs(8 * HOUR), Duration::from_secs(2 * HOUR));
        let single_use = ExpirationPolicy::single_use(Duration::from_secs(10));

        let defaults = HashMap::from([
            (TicketKind::TicketGranting, granting.clone()),
            (TicketKind::ProxyGranting, granting.clone()),
            (TicketKind::Service, single_use.clone()),
            (TicketKind::Proxy, single_use),
            (
                TicketKind::OAuthCode,
                ExpirationPolicy::single_use(Duration::from_secs(30)),
            ),
            (TicketKind::AccessToken, granting),
            (
                TicketKind::RefreshToken,
                ExpirationPolicy::time_to_live(Duration::from_secs(30 * DAY)),
            ),
        ]);

        Self {
            defaults,
            per_service: HashMap::new(),
            refresh_tokens_sovereign: false,
        }
    }

    /// Replace the default policy for `kind`.
    #[must_use]
    pub fn with_policy(mut self, kind: TicketKind, policy: ExpirationPolicy) -> Self {
        self.defaults.insert(kind, policy);
        self
    }

    /// Override the policy for `kind` when issued for `service`.
    #[must_use]
    pub fn with_service_policy(
        mut self,
        service: Service,
        kind: TicketKind,
        policy: ExpirationPolicy,
    ) -> Self {
        self.per_service.insert((service, kind), policy);
        self
    }

    /// Make refresh tokens outlive their ticket-granting ticket.
    ///
    /// Off by default: a refresh token normally dies with the login session.
    #[must_use]
    pub const fn with_sovereign_refresh_tokens(mut self, sovereign: bool) -> Self {
        self.refresh_tokens_sovereign = sovereign;
        self
    }

    /// Whether refresh tokens are issued as sovereign.
    #[must_use]
    pub const fn refresh_tokens_sovereign(&self) -> bool {
        self.refresh_tokens_sovereign
    }

    /// Policy for a new ticket of `kind` issued for `service`.
    #[must_use]
    pub fn policy_for(&self, kind: TicketKind, service: Option<&Service>) -> ExpirationPolicy {
        let policy = service
            .and_then(|service| self.per_service.get(&(service.clone(), kind)))
            .or_else(|| self.defaults.get(&kind))
            .cloned()
            .unwrap_or(ExpirationPolicy::AlwaysExpires);

        if kind == TicketKind::RefreshToken
            && self.refresh_tokens_sovereign
            && !matches!(policy, ExpirationPolicy::Sovereign { .. })
        {
            policy.sovereign()
        } else {
            policy
        }
    }
}

impl Default for TicketPolicies {
    fn default() -> Self {
        Self::new()
    }
}
