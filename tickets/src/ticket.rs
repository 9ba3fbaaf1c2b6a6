//! Ticket model.
//!
//! Tickets form chains rooted at a ticket-granting ticket. Links are stored as
//! IDs only: a ticket names its parent, and a granting ticket keeps the IDs of
//! the children it issued. The registry owns every ticket's existence, so the
//! chain never holds owning pointers.

use crate::constants::{attributes, prefixes};
use crate::error::{Result, TicketError};
use crate::expiration::{ExpirationPolicy, TicketUsage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
// Ticket Kinds and IDs
// ═══════════════════════════════════════════════════════════════════════

/// Closed set of ticket types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketKind {
    /// Root of a login session.
    TicketGranting,
    /// Single-use credential for one relying party.
    Service,
    /// Granting ticket held by a proxying service.
    ProxyGranting,
    /// Single-use credential issued to a proxying service.
    Proxy,
    /// OAuth authorization code.
    OAuthCode,
    /// OAuth access token.
    AccessToken,
    /// OAuth refresh token.
    RefreshToken,
}

impl TicketKind {
    /// Every ticket kind, in prefix order.
    pub const ALL: [Self; 7] = [
        Self::TicketGranting,
        Self::Service,
        Self::ProxyGranting,
        Self::Proxy,
        Self::OAuthCode,
        Self::AccessToken,
        Self::RefreshToken,
    ];

    /// ID prefix of this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => prefixes::TICKET_GRANTING,
            Self::Service => prefixes::SERVICE,
            Self::ProxyGranting => prefixes::PROXY_GRANTING,
            Self::Proxy => prefixes::PROXY,
            Self::OAuthCode => prefixes::OAUTH_CODE,
            Self::AccessToken => prefixes::ACCESS_TOKEN,
            Self::RefreshToken => prefixes::REFRESH_TOKEN,
        }
    }

    /// Kind for an ID prefix.
    #[must_use]
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == prefix)
    }

    /// Whether tickets of this kind are valid for exactly one presentation.
    #[must_use]
    pub const fn is_single_use(self) -> bool {
        matches!(self, Self::Service | Self::Proxy | Self::OAuthCode)
    }

    /// Whether tickets of this kind are bound to a relying party.
    #[must_use]
    pub const fn requires_service(self) -> bool {
        !matches!(self, Self::TicketGranting)
    }

    /// Whether a ticket of this kind may be the parent of a `child` ticket.
    #[must_use]
    pub const fn can_grant(self, child: Self) -> bool {
        match self {
            Self::TicketGranting => !matches!(child, Self::TicketGranting),
            Self::ProxyGranting => matches!(child, Self::Proxy),
            Self::RefreshToken => matches!(child, Self::AccessToken),
            Self::Service | Self::Proxy | Self::OAuthCode | Self::AccessToken => false,
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Ticket identifier: `<PREFIX>-<opaque token>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketId(String);

impl TicketId {
    /// Parse a presented ticket ID.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::InvalidTicket` if the prefix is unknown, the token
    /// is empty, or the ID contains characters outside the URL-safe set.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sso_tickets::ticket::{TicketId, TicketKind};
    /// let id = TicketId::parse("ST-1-abc").unwrap();
    /// assert_eq!(id.kind(), TicketKind::Service);
    /// assert!(TicketId::parse("XX-1-abc").is_err());
    /// ```
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((prefix, token)) = raw.split_once('-') else {
            return Err(TicketError::invalid(format!("missing type prefix in {raw:?}")));
        };

        if TicketKind::from_prefix(prefix).is_none() {
            return Err(TicketError::invalid(format!("unknown ticket prefix {prefix:?}")));
        }

        if token.is_empty() {
            return Err(TicketError::invalid("empty ticket token"));
        }

        let url_safe = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
        if !token.chars().all(url_safe) {
            return Err(TicketError::invalid("ticket ID contains illegal characters"));
        }

        Ok(Self(raw.to_string()))
    }

    /// Ticket kind, read from the prefix.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.0
            .split_once('-')
            .and_then(|(prefix, _)| TicketKind::from_prefix(prefix))
            // `parse` is the only constructor, so the prefix is always known.
            .unwrap_or(TicketKind::TicketGranting)
    }

    /// ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TicketId {
    type Error = TicketError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<TicketId> for String {
    fn from(id: TicketId) -> Self {
        id.0
    }
}

impl AsRef<str> for TicketId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Services and Authentication
// ═══════════════════════════════════════════════════════════════════════

/// Relying-party identifier a ticket is issued for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service(pub String);

impl Service {
    /// Create a service identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Snapshot of the authentication event a ticket chain descends from.
///
/// Copied by value into every ticket at mint time, so later changes to the
/// login state cannot alter tickets already issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// Authenticated principal.
    pub principal_id: String,

    /// Principal attributes.
    pub attributes: BTreeMap<String, Vec<String>>,

    /// Names of the handlers that verified the credentials.
    pub successful_handlers: Vec<String>,

    /// When the credentials were verified.
    pub authenticated_at: DateTime<Utc>,
}

impl Authentication {
    /// Create a snapshot with no attributes.
    #[must_use]
    pub fn new(principal_id: impl Into<String>, authenticated_at: DateTime<Utc>) -> Self {
        Self {
            principal_id: principal_id.into(),
            attributes: BTreeMap::new(),
            successful_handlers: Vec::new(),
            authenticated_at,
        }
    }

    /// Add an attribute value.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// Record a successful handler.
    #[must_use]
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.successful_handlers.push(handler.into());
        self
    }

    /// Whether the user asked to be remembered.
    #[must_use]
    pub fn is_remember_me(&self) -> bool {
        self.attributes
            .get(attributes::REMEMBER_ME)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case("true")))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Ticket
// ═══════════════════════════════════════════════════════════════════════

/// A ticket of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    id: TicketId,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
    use_count: u32,
    expiration_policy: ExpirationPolicy,
    expired: bool,
    parent: Option<TicketId>,
    descendants: BTreeMap<TicketId, DateTime<Utc>>,
    service: Option<Service>,
    authentication: Authentication,
    single_use: bool,
    scopes: BTreeSet<String>,
}

impl Ticket {
    /// Create a ticket minted at `created_at`.
    ///
    /// Chain rules are enforced by the factory; this only assembles the value.
    #[must_use]
    pub fn new(
        id: TicketId,
        created_at: DateTime<Utc>,
        expiration_policy: ExpirationPolicy,
        parent: Option<TicketId>,
        service: Option<Service>,
        authentication: Authentication,
    ) -> Self {
        let single_use = id.kind().is_single_use();
        Self {
            id,
            created_at,
            last_used_at: created_at,
            use_count: 0,
            expiration_policy,
            expired: false,
            parent,
            descendants: BTreeMap::new(),
            service,
            authentication,
            single_use,
            scopes: BTreeSet::new(),
        }
    }

    /// Attach OAuth scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the single-use flag derived from the kind.
    #[must_use]
    pub const fn with_single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    /// Ticket ID.
    #[must_use]
    pub const fn id(&self) -> &TicketId {
        &self.id
    }

    /// Ticket kind.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        self.id.kind()
    }

    /// Mint time.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last recorded use.
    #[must_use]
    pub const fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Number of recorded uses.
    #[must_use]
    pub const fn use_count(&self) -> u32 {
        self.use_count
    }

    /// Embedded expiration policy.
    #[must_use]
    pub const fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    /// Parent ticket ID (`None` for a ticket-granting ticket).
    #[must_use]
    pub const fn parent(&self) -> Option<&TicketId> {
        self.parent.as_ref()
    }

    /// IDs of children this ticket issued, with their issue time.
    #[must_use]
    pub const fn descendants(&self) -> &BTreeMap<TicketId, DateTime<Utc>> {
        &self.descendants
    }

    /// Relying party this ticket is bound to.
    #[must_use]
    pub const fn service(&self) -> Option<&Service> {
        self.service.as_ref()
    }

    /// Authentication snapshot.
    #[must_use]
    pub const fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    /// Whether the ticket is valid for exactly one presentation.
    #[must_use]
    pub const fn is_single_use(&self) -> bool {
        self.single_use
    }

    /// OAuth scopes granted.
    #[must_use]
    pub const fn scopes(&self) -> &BTreeSet<String> {
        &self.scopes
    }

    /// Whether `mark_expired` has been called.
    #[must_use]
    pub const fn is_marked_expired(&self) -> bool {
        self.expired
    }

    /// Usage facts handed to the expiration policy.
    #[must_use]
    pub fn usage(&self) -> TicketUsage {
        TicketUsage {
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            use_count: self.use_count,
            remember_me: self.authentication.is_remember_me(),
        }
    }

    /// Expired by the sticky flag or by its own policy, ignoring ancestors.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expired || self.expiration_policy.is_expired(&self.usage(), now)
    }

    /// Expired by itself or, unless the policy is sovereign, by any ancestor.
    ///
    /// `ancestors` is the resolved chain above this ticket, nearest first.
    #[must_use]
    pub fn is_expired_within(&self, now: DateTime<Utc>, ancestors: &[Ticket]) -> bool {
        if self.is_expired_at(now) {
            return true;
        }
        !self.ignores_cascade()
            && ancestors.iter().any(|ancestor| ancestor.is_expired_at(now))
    }

    /// Whether this ticket outlives the tickets above it (sovereign policy).
    #[must_use]
    pub fn ignores_cascade(&self) -> bool {
        self.expiration_policy.ignores_cascade(&self.usage())
    }

    /// Set the sticky expired flag. Idempotent.
    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    /// Record one successful use.
    ///
    /// Does nothing when the policy does not track use. `last_used_at` never
    /// moves backwards or before `created_at`.
    pub fn update(&mut self, now: DateTime<Utc>) {
        if !self.expiration_policy.tracks_use() {
            return;
        }
        self.use_count = self.use_count.saturating_add(1);
        self.last_used_at = self.last_used_at.max(now).max(self.created_at);
    }

    /// Whether the ticket may be presented against `service`.
    #[must_use]
    pub fn is_valid_for(&self, service: &Service) -> bool {
        self.service.as_ref().is_some_and(|bound| bound == service)
    }

    /// Record a child issued at `issued_at`.
    pub fn add_descendant(&mut self, child: TicketId, issued_at: DateTime<Utc>) {
        self.descendants.insert(child, issued_at);
    }

    /// Forget a child. Returns whether it was recorded.
    pub fn remove_descendant(&mut self, child: &TicketId) -> bool {
        self.descendants.remove(child).is_some()
    }

    /// Carry over what another writer recorded on `stored` since `self` was
    /// read. The sticky flag, issued children and recorded uses never go back.
    pub fn retain_progress_of(&mut self, stored: &Self) {
        self.expired |= stored.expired;
        for (child, issued_at) in &stored.descendants {
            self.descendants.entry(child.clone()).or_insert(*issued_at);
        }
        self.use_count = self.use_count.max(stored.use_count);
        self.last_used_at = self.last_used_at.max(stored.last_used_at);
    }

    /// Backend TTL hint for this ticket at `now`.
    #[must_use]
    pub fn storage_ttl(&self, now: DateTime<Utc>) -> Option<std::time::Duration> {
        self.expiration_policy.storage_ttl(&self.usage(), now)
    }
}
