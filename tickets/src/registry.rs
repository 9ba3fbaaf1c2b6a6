//! Ticket registry.
//!
//! The registry owns the existence of every ticket. It sits between callers and
//! a [`TicketStorage`] backend, and is the only place where encoding, expiry
//! on read, cascade and single-use consumption come together.
//!
//! # Storage layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `ticket:{encoded id}` | codec blob |
//! | `consumed:{encoded id}` | empty marker, lives for `consumed_marker_ttl` |
//!
//! The encoded ID keeps the ticket type prefix, so kind filters are applied to
//! keys before anything is decoded.
//!
//! # Expiry
//!
//! A ticket is expired when its sticky flag is set, its own policy says so, or
//! (unless its policy is sovereign) any ticket above it in the chain is
//! expired. A missing ancestor counts as expired. `get` evicts expired tickets
//! and reports them as not found; `consume` reports them as expired.
//!
//! # Concurrent writers
//!
//! Every change to a stored ticket goes through [`TicketRegistry::modify`], a
//! compare-and-swap loop: a write based on a stale read is retried against the
//! fresh version, so a logout racing a mint or a consumption is never lost,
//! and a ticket deleted in the meantime is never written back.
//!
//! # Failure semantics
//!
//! Every backend call is bounded by `RegistryConfig::operation_timeout`.
//! Timeouts and backend failures surface as `TicketError::RegistryUnavailable`.
//! Entries that fail to decode are logged, counted, and treated as absent.

use crate::codec::{EncodedTicket, TicketCodec};
use crate::config::RegistryConfig;
use crate::constants::keys;
use crate::environment::Clock;
use crate::error::{Result, TicketError};
use crate::providers::TicketStorage;
use crate::ticket::{Service, Ticket, TicketId, TicketKind};
use chrono::{DateTime, Utc};
use futures::Stream;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lazy sequence of tickets produced by [`TicketRegistry::get_all`].
pub type TicketStream<'a> = Pin<Box<dyn Stream<Item = Result<Ticket>> + Send + 'a>>;

/// Ancestors fetched during one lineage-resolving pass.
type AncestorCache = HashMap<TicketId, Option<Ticket>>;

// ═══════════════════════════════════════════════════════════════════════
// Filters and Statistics
// ═══════════════════════════════════════════════════════════════════════

/// Selection applied by [`TicketRegistry::get_all`] and [`TicketRegistry::count`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketFilter {
    /// Only tickets of this kind. Applied to storage keys, before decoding.
    pub kind: Option<TicketKind>,

    /// Only tickets issued to this principal.
    pub principal: Option<String>,

    /// Also yield expired tickets that have not been evicted yet.
    pub include_expired: bool,
}

impl TicketFilter {
    /// Every live ticket.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Live tickets of one kind.
    #[must_use]
    pub fn kind(kind: TicketKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    /// Restrict to one principal.
    #[must_use]
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Include expired tickets.
    #[must_use]
    pub const fn including_expired(mut self) -> Self {
        self.include_expired = true;
        self
    }

    fn key_prefix(&self) -> String {
        match self.kind {
            Some(kind) => format!("{}{}-", keys::TICKET, kind.prefix()),
            None => keys::TICKET.to_string(),
        }
    }
}

/// Point-in-time registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Stored entries per ticket kind, expired-but-unswept included.
    pub tickets_by_kind: BTreeMap<TicketKind, usize>,

    /// Entries that failed to decode since this registry was created.
    pub corrupt_entries: u64,

    /// Tickets evicted on read.
    pub evictions: u64,

    /// Successful consumptions.
    pub consumptions: u64,

    /// Presentations of already-consumed single-use tickets.
    pub replays_rejected: u64,

    /// Entries removed by sweeps.
    pub swept: u64,
}

impl RegistryStats {
    /// Stored ticket-granting tickets (login sessions).
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.count_of(TicketKind::TicketGranting)
    }

    /// Stored service tickets.
    #[must_use]
    pub fn service_ticket_count(&self) -> usize {
        self.count_of(TicketKind::Service)
    }

    /// Stored entries of all kinds.
    #[must_use]
    pub fn total(&self) -> usize {
        self.tickets_by_kind.values().sum()
    }

    fn count_of(&self, kind: TicketKind) -> usize {
        self.tickets_by_kind.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct Counters {
    corrupt: AtomicU64,
    evictions: AtomicU64,
    consumptions: AtomicU64,
    replays: AtomicU64,
    swept: AtomicU64,
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Ticket registry over a storage backend.
///
/// Cheap to clone; clones share the backend, codec, clock and counters.
pub struct TicketRegistry<S> {
    storage: Arc<S>,
    codec: Arc<dyn TicketCodec>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    counters: Arc<Counters>,
}

impl<S> Clone for TicketRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            codec: Arc::clone(&self.codec),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<S: TicketStorage> TicketRegistry<S> {
    /// Create a registry.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use sso_tickets::codec::PlainTicketCodec;
    /// use sso_tickets::config::RegistryConfig;
    /// use sso_tickets::environment::SystemClock;
    /// use sso_tickets::registry::TicketRegistry;
    /// use sso_tickets::stores::MemoryTicketStorage;
    ///
    /// let registry = TicketRegistry::new(
    ///     MemoryTicketStorage::new(),
    ///     Arc::new(PlainTicketCodec),
    ///     Arc::new(SystemClock),
    ///     RegistryConfig::default(),
    /// );
    /// ```
    pub fn new(
        storage: S,
        codec: Arc<dyn TicketCodec>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            codec,
            clock,
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current time according to the injected clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Storage key of the ticket `id`.
    #[must_use]
    pub fn storage_key(&self, id: &TicketId) -> String {
        format!("{}{}", keys::TICKET, self.codec.encode_id(id))
    }

    fn consumed_key(&self, id: &TicketId) -> String {
        format!("{}{}", keys::CONSUMED, self.codec.encode_id(id))
    }

    // ───────────────────────────────────────────────────────────────────
    // Writes
    // ───────────────────────────────────────────────────────────────────

    /// Store a newly minted ticket.
    ///
    /// # Errors
    ///
    /// - `TicketError::DuplicateTicket` if the ID is already stored
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    pub async fn add(&self, ticket: &Ticket) -> Result<()> {
        let now = self.clock.now();
        let encoded = self.codec.encode(ticket)?;
        let key = format!("{}{}", keys::TICKET, encoded.id);

        let stored = self
            .guarded(
                "put_if_absent",
                self.storage
                    .put_if_absent(&key, encoded.blob, ticket.storage_ttl(now)),
            )
            .await?;

        if !stored {
            tracing::warn!(ticket_id = %ticket.id(), "Ticket ID collision on add");
            return Err(TicketError::DuplicateTicket {
                id: ticket.id().to_string(),
            });
        }

        tracing::debug!(
            ticket_id = %ticket.id(),
            kind = ?ticket.kind(),
            policy = ticket.expiration_policy().name(),
            "Ticket added"
        );
        Ok(())
    }

    /// Persist a changed ticket, replacing the stored version.
    ///
    /// Progress another writer recorded in the meantime is kept: the sticky
    /// expired flag, issued children and recorded uses are merged into
    /// `ticket` rather than overwritten. A ticket deleted in the meantime stays
    /// deleted.
    ///
    /// # Returns
    ///
    /// The ticket as stored.
    ///
    /// # Errors
    ///
    /// - `TicketError::TicketNotFound` if the ticket is no longer stored
    /// - `TicketError::RegistryUnavailable` if the backend fails, times out, or
    ///   the write stays contended past `max_write_retries`
    pub async fn update(&self, ticket: &Ticket) -> Result<Ticket> {
        self.modify(ticket.id(), |stored| {
            let mut replacement = ticket.clone();
            replacement.retain_progress_of(stored);
            *stored = replacement;
            Ok(())
        })
        .await
    }

    /// Set the sticky expired flag on a stored ticket (logout).
    ///
    /// Tickets chained below it report expired from now on without being
    /// touched themselves.
    ///
    /// # Errors
    ///
    /// - `TicketError::TicketNotFound` if the ticket is not stored
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    pub async fn mark_expired(&self, id: &TicketId) -> Result<Ticket> {
        let ticket = self
            .modify(id, |ticket| {
                ticket.mark_expired();
                Ok(())
            })
            .await?;

        tracing::info!(ticket_id = %id, "Ticket marked expired");
        Ok(ticket)
    }

    /// Read-modify-write of one stored ticket.
    ///
    /// `change` runs against the current stored version, and the result is
    /// written only if the entry still holds exactly what was read. If another
    /// writer got there first, the ticket is read again and `change` re-runs,
    /// so it must not have side effects beyond the ticket. An error from
    /// `change` aborts without writing.
    ///
    /// # Returns
    ///
    /// The ticket as stored.
    ///
    /// # Errors
    ///
    /// - `TicketError::TicketNotFound` if the ticket is absent or corrupt
    /// - whatever `change` returns
    /// - `TicketError::RegistryUnavailable` if the backend fails, times out, or
    ///   the write stays contended past `max_write_retries`
    pub async fn modify<F>(&self, id: &TicketId, mut change: F) -> Result<Ticket>
    where
        F: FnMut(&mut Ticket) -> Result<()> + Send,
    {
        let encoded_id = self.codec.encode_id(id);
        let key = format!("{}{encoded_id}", keys::TICKET);

        for attempt in 0..=self.config.max_write_retries {
            let Some(current) = self.guarded("get", self.storage.get(&key)).await? else {
                return Err(TicketError::TicketNotFound { id: id.to_string() });
            };
            let Some(mut ticket) = self.decode(&key, encoded_id.clone(), current.clone()) else {
                return Err(TicketError::TicketNotFound { id: id.to_string() });
            };

            change(&mut ticket)?;

            let encoded = self.codec.encode(&ticket)?;
            let ttl = ticket.storage_ttl(self.clock.now());
            let swapped = self
                .guarded(
                    "compare_and_swap",
                    self.storage.compare_and_swap(&key, &current, encoded.blob, ttl),
                )
                .await?;
            if swapped {
                return Ok(ticket);
            }

            metrics::counter!("tickets.registry.write_conflict").increment(1);
            tracing::debug!(ticket_id = %id, attempt = attempt, "Concurrent ticket write, retrying");
            tokio::task::yield_now().await;
        }

        tracing::warn!(
            ticket_id = %id,
            retries = self.config.max_write_retries,
            "Ticket write still contended, giving up"
        );
        Err(TicketError::unavailable(format!(
            "write to {id} still contended after {} retries",
            self.config.max_write_retries
        )))
    }

    // ───────────────────────────────────────────────────────────────────
    // Reads
    // ───────────────────────────────────────────────────────────────────

    /// Fetch a live ticket.
    ///
    /// An expired ticket is evicted, together with the tickets it cascades to,
    /// and reported as not found.
    ///
    /// # Errors
    ///
    /// - `TicketError::TicketNotFound` if absent, corrupt, or expired
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    pub async fn get(&self, id: &TicketId) -> Result<Ticket> {
        let now = self.clock.now();
        let Some(ticket) = self.load(id).await? else {
            return Err(TicketError::TicketNotFound { id: id.to_string() });
        };

        if self.expired_at(&ticket, now, &mut AncestorCache::new()).await? {
            self.evict(&ticket).await?;
            return Err(TicketError::TicketNotFound { id: id.to_string() });
        }

        Ok(ticket)
    }

    /// Fetch a live ticket of an expected kind.
    ///
    /// # Errors
    ///
    /// - `TicketError::InvalidTicket` if `id` is not of kind `kind`
    /// - otherwise as [`get`](Self::get)
    pub async fn get_typed(&self, id: &TicketId, kind: TicketKind) -> Result<Ticket> {
        if id.kind() != kind {
            return Err(TicketError::invalid(format!(
                "expected a {kind} ticket, got {}",
                id.kind()
            )));
        }
        self.get(id).await
    }

    /// Fetch a stored ticket as-is: no expiry check, no eviction.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn load(&self, id: &TicketId) -> Result<Option<Ticket>> {
        let encoded_id = self.codec.encode_id(id);
        let key = format!("{}{encoded_id}", keys::TICKET);
        let Some(blob) = self.guarded("get", self.storage.get(&key)).await? else {
            return Ok(None);
        };
        Ok(self.decode(&key, encoded_id, blob))
    }

    /// Stream tickets matching `filter`.
    ///
    /// The stream is lazy: nothing is read until it is polled. Calling
    /// `get_all` again starts a fresh pass. Corrupt entries are skipped.
    pub fn get_all(&self, filter: TicketFilter) -> TicketStream<'_> {
        Box::pin(async_stream::try_stream! {
            let keys = self.guarded("scan", self.storage.scan(&filter.key_prefix())).await?;
            let now = self.clock.now();
            let mut ancestors = AncestorCache::new();

            for key in keys {
                let Some(encoded_id) = key.strip_prefix(keys::TICKET) else {
                    continue;
                };
                let Some(blob) = self.guarded("get", self.storage.get(&key)).await? else {
                    continue;
                };
                let Some(ticket) = self.decode(&key, encoded_id.to_string(), blob) else {
                    continue;
                };

                if filter
                    .principal
                    .as_ref()
                    .is_some_and(|principal| ticket.authentication().principal_id != *principal)
                {
                    continue;
                }

                if !filter.include_expired && self.expired_at(&ticket, now, &mut ancestors).await? {
                    continue;
                }

                yield ticket;
            }
        })
    }

    /// Count tickets matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn count(&self, filter: TicketFilter) -> Result<usize> {
        use futures::TryStreamExt;

        self.get_all(filter)
            .try_fold(0usize, |count, _| async move { Ok(count + 1) })
            .await
    }

    /// Whether `ticket` is expired, resolving its chain from the registry.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn is_expired(&self, ticket: &Ticket) -> Result<bool> {
        self.expired_at(ticket, self.clock.now(), &mut AncestorCache::new())
            .await
    }

    /// Registry statistics. Kind counts come from storage keys, nothing is decoded.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn stats(&self) -> Result<RegistryStats> {
        let keys = self.guarded("scan", self.storage.scan(keys::TICKET)).await?;

        let mut tickets_by_kind = BTreeMap::new();
        for key in &keys {
            let kind = key
                .strip_prefix(keys::TICKET)
                .and_then(|encoded| encoded.split_once('-'))
                .and_then(|(prefix, _)| TicketKind::from_prefix(prefix));
            if let Some(kind) = kind {
                *tickets_by_kind.entry(kind).or_insert(0) += 1;
            }
        }

        Ok(RegistryStats {
            tickets_by_kind,
            corrupt_entries: self.counters.corrupt.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            consumptions: self.counters.consumptions.load(Ordering::Relaxed),
            replays_rejected: self.counters.replays.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
        })
    }

    // ───────────────────────────────────────────────────────────────────
    // Deletion
    // ───────────────────────────────────────────────────────────────────

    /// Delete one ticket. Deleting a missing ticket is not an error.
    ///
    /// # Returns
    ///
    /// `true` if a ticket was removed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn delete(&self, id: &TicketId) -> Result<bool> {
        let key = self.storage_key(id);
        let removed = self.guarded("delete", self.storage.delete(&key)).await?;
        if removed {
            tracing::debug!(ticket_id = %id, "Ticket deleted");
        }
        Ok(removed)
    }

    /// Delete every ticket and consumed marker.
    ///
    /// # Returns
    ///
    /// Number of tickets removed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn delete_all(&self) -> Result<usize> {
        let removed = self.guarded("clear", self.storage.clear(keys::TICKET)).await?;
        self.guarded("clear", self.storage.clear(keys::CONSUMED))
            .await?;

        tracing::warn!(removed = removed, "All tickets deleted");
        Ok(removed)
    }

    /// Delete a ticket and, transitively, every ticket it issued.
    ///
    /// Descendants that are already gone are skipped; sovereign descendants
    /// survive. Not atomic as a whole, but a retry converges.
    ///
    /// # Returns
    ///
    /// Number of tickets removed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn delete_with_children(&self, id: &TicketId) -> Result<usize> {
        let mut queue = VecDeque::from([id.clone()]);
        let mut visited = HashSet::new();
        let mut removed = 0;

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.clone()) {
                continue;
            }

            let is_root = current == *id;
            if let Some(ticket) = self.load(&current).await? {
                if !is_root && ticket.ignores_cascade() {
                    tracing::debug!(ticket_id = %current, "Sovereign ticket skipped by cascade");
                    continue;
                }
                queue.extend(ticket.descendants().keys().cloned());
            }

            if self.delete(&current).await? {
                removed += 1;
            }
        }

        tracing::info!(ticket_id = %id, removed = removed, "Ticket chain deleted");
        Ok(removed)
    }

    async fn evict(&self, ticket: &Ticket) -> Result<()> {
        let removed = self.delete_with_children(ticket.id()).await?;
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tickets.registry.evicted").increment(1);
        tracing::debug!(ticket_id = %ticket.id(), removed = removed, "Expired ticket evicted on read");
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────────
    // Consumption
    // ───────────────────────────────────────────────────────────────────

    /// Record one presentation of a ticket.
    ///
    /// Single-use tickets are removed with an atomic take: of any number of
    /// concurrent callers, exactly one succeeds and the rest observe
    /// `AlreadyConsumed` (or `TicketNotFound` if they lose the race before the
    /// consumed marker is visible). Multi-use tickets record the use and stay
    /// stored until their policy runs out.
    ///
    /// # Returns
    ///
    /// The ticket as of this use.
    ///
    /// # Errors
    ///
    /// - `TicketError::TicketNotFound` if absent or corrupt
    /// - `TicketError::AlreadyConsumed` if a single-use ticket is replayed
    /// - `TicketError::TicketExpired` if the ticket or its chain has expired
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    pub async fn consume(&self, id: &TicketId) -> Result<Ticket> {
        let now = self.clock.now();
        let Some(snapshot) = self.load(id).await? else {
            return Err(self.missing(id).await?);
        };

        if snapshot.is_single_use() {
            self.consume_once(id, now).await
        } else {
            self.consume_shared(snapshot, now).await
        }
    }

    /// Record one presentation of a ticket by `service`.
    ///
    /// As [`consume`](Self::consume), except that a multi-use ticket bound to
    /// another service is refused before any use is recorded. A single-use
    /// ticket is burned either way, so a wrong presentation cannot be retried.
    ///
    /// # Errors
    ///
    /// - `TicketError::ServiceMismatch` if the ticket is bound to another service
    /// - otherwise as [`consume`](Self::consume)
    pub async fn consume_bound(&self, id: &TicketId, service: &Service) -> Result<Ticket> {
        let now = self.clock.now();
        let Some(snapshot) = self.load(id).await? else {
            return Err(self.missing(id).await?);
        };

        let ticket = if snapshot.is_single_use() {
            self.consume_once(id, now).await?
        } else if snapshot.is_valid_for(service) {
            self.consume_shared(snapshot, now).await?
        } else {
            snapshot
        };

        if ticket.is_valid_for(service) {
            Ok(ticket)
        } else {
            tracing::debug!(ticket_id = %id, uses = ticket.use_count(), "Service binding mismatch");
            Err(TicketError::ServiceMismatch {
                id: id.to_string(),
                service: service.to_string(),
            })
        }
    }

    async fn consume_once(&self, id: &TicketId, now: DateTime<Utc>) -> Result<Ticket> {
        let key = self.storage_key(id);

        // Marker first, so callers losing the take below already see it.
        self.guarded(
            "put",
            self.storage.put(
                &self.consumed_key(id),
                Vec::new(),
                Some(self.config.consumed_marker_ttl),
            ),
        )
        .await?;

        let Some(blob) = self.guarded("take", self.storage.take(&key)).await? else {
            return Err(self.missing(id).await?);
        };

        let Some(mut ticket) = self.decode(&key, self.codec.encode_id(id), blob) else {
            return Err(TicketError::TicketNotFound { id: id.to_string() });
        };

        if self.expired_at(&ticket, now, &mut AncestorCache::new()).await? {
            tracing::info!(ticket_id = %id, "Expired single-use ticket presented");
            return Err(TicketError::TicketExpired { id: id.to_string() });
        }

        ticket.update(now);
        self.record_consumption(&ticket);
        Ok(ticket)
    }

    async fn consume_shared(&self, snapshot: Ticket, now: DateTime<Utc>) -> Result<Ticket> {
        let expired = |id: &TicketId| TicketError::TicketExpired { id: id.to_string() };

        if self.expired_at(&snapshot, now, &mut AncestorCache::new()).await? {
            self.evict(&snapshot).await?;
            tracing::info!(ticket_id = %snapshot.id(), "Expired ticket presented");
            return Err(expired(snapshot.id()));
        }

        // Uses recorded concurrently count against the limit too.
        let ticket = self
            .modify(snapshot.id(), |ticket| {
                if ticket.is_expired_at(now) {
                    return Err(expired(ticket.id()));
                }
                ticket.update(now);
                Ok(())
            })
            .await?;

        // The use just recorded may have been the last one the policy allows.
        if ticket.is_expired_at(now) {
            self.delete(ticket.id()).await?;
        }

        self.record_consumption(&ticket);
        Ok(ticket)
    }

    async fn missing(&self, id: &TicketId) -> Result<TicketError> {
        let marker = self
            .guarded("get", self.storage.get(&self.consumed_key(id)))
            .await?;

        if marker.is_some() {
            self.counters.replays.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("tickets.registry.replay_rejected").increment(1);
            tracing::warn!(ticket_id = %id, "Replay of consumed ticket rejected");
            Ok(TicketError::AlreadyConsumed { id: id.to_string() })
        } else {
            Ok(TicketError::TicketNotFound { id: id.to_string() })
        }
    }

    fn record_consumption(&self, ticket: &Ticket) {
        self.counters.consumptions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("tickets.registry.consumed", "kind" => ticket.kind().prefix()).increment(1);
        tracing::debug!(
            ticket_id = %ticket.id(),
            use_count = ticket.use_count(),
            "Ticket consumed"
        );
    }

    // ───────────────────────────────────────────────────────────────────
    // Sweeping
    // ───────────────────────────────────────────────────────────────────

    /// Remove every expired, orphaned or corrupt ticket.
    ///
    /// Idempotent and safe to run on several nodes at once: deleting an entry
    /// another sweep already removed is a no-op.
    ///
    /// # Returns
    ///
    /// Number of entries removed by this pass.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails or times out.
    pub async fn sweep(&self) -> Result<usize> {
        let now = self.clock.now();
        let keys = self.guarded("scan", self.storage.scan(keys::TICKET)).await?;
        let mut ancestors = AncestorCache::new();
        let mut removed = 0;

        for key in keys {
            let Some(encoded_id) = key.strip_prefix(keys::TICKET) else {
                continue;
            };
            let Some(blob) = self.guarded("get", self.storage.get(&key)).await? else {
                continue;
            };

            let remove = match self.decode(&key, encoded_id.to_string(), blob) {
                Some(ticket) => self.expired_at(&ticket, now, &mut ancestors).await?,
                None => true,
            };

            if remove && self.guarded("delete", self.storage.delete(&key)).await? {
                removed += 1;
            }
        }

        let removed_count = u64::try_from(removed).unwrap_or(u64::MAX);
        self.counters.swept.fetch_add(removed_count, Ordering::Relaxed);
        metrics::counter!("tickets.registry.swept").increment(removed_count);
        tracing::info!(removed = removed, "Ticket sweep completed");

        Ok(removed)
    }

    // ───────────────────────────────────────────────────────────────────
    // Internals
    // ───────────────────────────────────────────────────────────────────

    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        if let Ok(result) = tokio::time::timeout(self.config.operation_timeout, call).await {
            result
        } else {
            metrics::counter!("tickets.registry.timeout", "operation" => operation).increment(1);
            tracing::error!(
                operation = operation,
                timeout_ms = u64::try_from(self.config.operation_timeout.as_millis()).unwrap_or(u64::MAX),
                "Ticket storage operation timed out"
            );
            Err(TicketError::unavailable(format!(
                "{operation} timed out after {:?}",
                self.config.operation_timeout
            )))
        }
    }

    fn decode(&self, key: &str, encoded_id: String, blob: Vec<u8>) -> Option<Ticket> {
        match self.codec.decode(&EncodedTicket {
            id: encoded_id,
            blob,
        }) {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                self.counters.corrupt.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("tickets.registry.corrupt").increment(1);
                tracing::error!(key = key, error = %e, "Corrupt ticket entry treated as absent");
                None
            }
        }
    }

    async fn expired_at(
        &self,
        ticket: &Ticket,
        now: DateTime<Utc>,
        cache: &mut AncestorCache,
    ) -> Result<bool> {
        if ticket.is_expired_at(now) {
            return Ok(true);
        }
        if ticket.ignores_cascade() {
            return Ok(false);
        }

        match self.lineage(ticket, cache).await? {
            Some(ancestors) => Ok(ticket.is_expired_within(now, &ancestors)),
            None => {
                tracing::debug!(ticket_id = %ticket.id(), "Ticket orphaned by a missing ancestor");
                Ok(true)
            }
        }
    }

    /// Ancestors of `ticket`, nearest first, up to and including the first
    /// sovereign one. `None` if an ancestor is missing.
    async fn lineage(&self, ticket: &Ticket, cache: &mut AncestorCache) -> Result<Option<Vec<Ticket>>> {
        let mut ancestors = Vec::new();
        let mut next = ticket.parent().cloned();

        while let Some(parent_id) = next {
            if ancestors.len() >= self.config.max_chain_depth {
                tracing::warn!(
                    ticket_id = %ticket.id(),
                    depth = ancestors.len(),
                    "Ticket chain deeper than max_chain_depth, stopping resolution"
                );
                break;
            }

            let parent = if let Some(cached) = cache.get(&parent_id) {
                cached.clone()
            } else {
                let loaded = self.load(&parent_id).await?;
                cache.insert(parent_id, loaded.clone());
                loaded
            };

            let Some(parent) = parent else {
                return Ok(None);
            };

            next = if parent.ignores_cascade() {
                None
            } else {
                parent.parent().cloned()
            };
            ancestors.push(parent);
        }

        Ok(Some(ancestors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PlainTicketCodec, SealedTicketCodec};
    use crate::expiration::ExpirationPolicy;
    use crate::mocks::{ManualClock, SlowStorage, UnavailableStorage};
    use crate::stores::MemoryTicketStorage;
    use crate::ticket::{Authentication, Service};
    use chrono::TimeDelta;
    use futures::StreamExt;
    use std::time::Duration;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at_epoch())
    }

    fn registry(storage: MemoryTicketStorage, clock: &Arc<ManualClock>) -> TicketRegistry<MemoryTicketStorage> {
        TicketRegistry::new(
            storage,
            Arc::new(PlainTicketCodec),
            clock.clone(),
            RegistryConfig::default(),
        )
    }

    fn tgt(clock: &ManualClock, token: &str) -> Ticket {
        Ticket::new(
            TicketId::parse(&format!("TGT-1-{token}")).unwrap(),
            clock.now(),
            ExpirationPolicy::hard_and_idle(Duration::from_secs(7200), Duration::from_secs(1800)),
            None,
            None,
            Authentication::new("casuser", clock.now()),
        )
    }

    fn child(clock: &ManualClock, kind: TicketKind, token: &str, parent: &mut Ticket) -> Ticket {
        let policy = if kind.is_single_use() {
            ExpirationPolicy::single_use(Duration::from_secs(10))
        } else {
            ExpirationPolicy::time_to_live(Duration::from_secs(3600))
        };
        let ticket = Ticket::new(
            TicketId::parse(&format!("{}-1-{token}", kind.prefix())).unwrap(),
            clock.now(),
            policy,
            Some(parent.id().clone()),
            Some(Service::new("https://app.example.com")),
            parent.authentication().clone(),
        );
        parent.add_descendant(ticket.id().clone(), clock.now());
        ticket
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let root = tgt(&clock, "dup");

        registry.add(&root).await.unwrap();
        let result = registry.add(&root).await;
        assert!(matches!(result, Err(TicketError::DuplicateTicket { .. })));
    }

    #[tokio::test]
    async fn test_get_evicts_expired_ticket() {
        let clock = clock();
        let storage = MemoryTicketStorage::new();
        let registry = registry(storage.clone(), &clock);
        let root = tgt(&clock, "idle");
        registry.add(&root).await.unwrap();

        assert!(registry.get(root.id()).await.is_ok());

        clock.advance(TimeDelta::minutes(31));
        let result = registry.get(root.id()).await;
        assert!(matches!(result, Err(TicketError::TicketNotFound { .. })));
        assert!(storage.is_empty());
        assert_eq!(registry.stats().await.unwrap().evictions, 1);
    }

    #[tokio::test]
    async fn test_get_typed_rejects_wrong_kind() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let root = tgt(&clock, "typed");
        registry.add(&root).await.unwrap();

        let result = registry.get_typed(root.id(), TicketKind::Service).await;
        assert!(matches!(result, Err(TicketError::InvalidTicket { .. })));
        assert!(registry.get_typed(root.id(), TicketKind::TicketGranting).await.is_ok());
    }

    #[tokio::test]
    async fn test_mark_expired_cascades_without_touching_children() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "logout");
        let access = child(&clock, TicketKind::AccessToken, "access", &mut root);
        registry.add(&root).await.unwrap();
        registry.add(&access).await.unwrap();

        assert!(!registry.is_expired(&access).await.unwrap());
        registry.mark_expired(root.id()).await.unwrap();

        // The stored child is unchanged, yet reports expired.
        let stored = registry.load(access.id()).await.unwrap().unwrap();
        assert!(!stored.is_marked_expired());
        assert!(registry.is_expired(&stored).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_update_keeps_logout_and_children() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let root = tgt(&clock, "stale");
        registry.add(&root).await.unwrap();

        let mut stale = root.clone();
        let mut concurrent = root.clone();
        concurrent.add_descendant(TicketId::parse("ST-1-theirs").unwrap(), clock.now());
        registry.update(&concurrent).await.unwrap();
        registry.mark_expired(root.id()).await.unwrap();

        stale.add_descendant(TicketId::parse("ST-1-mine").unwrap(), clock.now());
        let stored = registry.update(&stale).await.unwrap();

        assert!(stored.is_marked_expired());
        assert_eq!(stored.descendants().len(), 2);
        assert_eq!(registry.load(root.id()).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn test_writes_never_resurrect_deleted_ticket() {
        let clock = clock();
        let storage = MemoryTicketStorage::new();
        let registry = registry(storage.clone(), &clock);
        let root = tgt(&clock, "deleted");
        registry.add(&root).await.unwrap();
        registry.delete(root.id()).await.unwrap();

        assert!(matches!(
            registry.update(&root).await,
            Err(TicketError::TicketNotFound { .. })
        ));
        assert!(matches!(
            registry.mark_expired(root.id()).await,
            Err(TicketError::TicketNotFound { .. })
        ));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_modify_error_writes_nothing() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let root = tgt(&clock, "refused");
        registry.add(&root).await.unwrap();

        let result = registry
            .modify(root.id(), |ticket| {
                ticket.mark_expired();
                Err(TicketError::invalid("refused"))
            })
            .await;

        assert!(matches!(result, Err(TicketError::InvalidTicket { .. })));
        assert_eq!(registry.load(root.id()).await.unwrap(), Some(root));
    }

    #[tokio::test]
    async fn test_missing_parent_orphans_child() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "gone");
        let access = child(&clock, TicketKind::AccessToken, "orphan", &mut root);
        registry.add(&access).await.unwrap();

        let result = registry.get(access.id()).await;
        assert!(matches!(result, Err(TicketError::TicketNotFound { .. })));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let root = tgt(&clock, "del");
        registry.add(&root).await.unwrap();

        assert!(registry.delete(root.id()).await.unwrap());
        assert!(!registry.delete(root.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_with_children_skips_missing_and_sovereign() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "cascade");
        let service = child(&clock, TicketKind::Service, "st", &mut root);
        // Recorded as a descendant but never stored.
        let _ghost = child(&clock, TicketKind::OAuthCode, "ghost", &mut root);
        let refresh = Ticket::new(
            TicketId::parse("RT-1-sovereign").unwrap(),
            clock.now(),
            ExpirationPolicy::time_to_live(Duration::from_secs(86_400)).sovereign(),
            Some(root.id().clone()),
            Some(Service::new("client")),
            root.authentication().clone(),
        );
        root.add_descendant(refresh.id().clone(), clock.now());

        registry.add(&root).await.unwrap();
        registry.add(&service).await.unwrap();
        registry.add(&refresh).await.unwrap();

        assert_eq!(registry.delete_with_children(root.id()).await.unwrap(), 2);
        assert!(registry.load(refresh.id()).await.unwrap().is_some());

        // Retrying converges.
        assert_eq!(registry.delete_with_children(root.id()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_single_use_then_replay() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "consume");
        let service = child(&clock, TicketKind::Service, "st-once", &mut root);
        registry.add(&root).await.unwrap();
        registry.add(&service).await.unwrap();

        let consumed = registry.consume(service.id()).await.unwrap();
        assert_eq!(consumed.use_count(), 1);

        let replay = registry.consume(service.id()).await;
        assert!(matches!(replay, Err(TicketError::AlreadyConsumed { .. })));

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.consumptions, 1);
        assert_eq!(stats.replays_rejected, 1);
    }

    #[tokio::test]
    async fn test_consume_expired_single_use() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "late");
        let service = child(&clock, TicketKind::Service, "st-late", &mut root);
        registry.add(&root).await.unwrap();
        registry.add(&service).await.unwrap();

        clock.advance(TimeDelta::seconds(11));
        let result = registry.consume(service.id()).await;
        assert!(matches!(result, Err(TicketError::TicketExpired { .. })));
    }

    #[tokio::test]
    async fn test_consume_multi_use_until_exhausted() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "multi");
        let proxy_granting = Ticket::new(
            TicketId::parse("PGT-1-multi").unwrap(),
            clock.now(),
            ExpirationPolicy::multi_use_or_timeout(2, Duration::from_secs(60)),
            Some(root.id().clone()),
            Some(Service::new("https://proxy.example.com")),
            root.authentication().clone(),
        );
        root.add_descendant(proxy_granting.id().clone(), clock.now());
        registry.add(&root).await.unwrap();
        registry.add(&proxy_granting).await.unwrap();

        assert_eq!(registry.consume(proxy_granting.id()).await.unwrap().use_count(), 1);
        assert_eq!(registry.consume(proxy_granting.id()).await.unwrap().use_count(), 2);

        let result = registry.consume(proxy_granting.id()).await;
        assert!(matches!(result, Err(TicketError::TicketNotFound { .. })));
    }

    #[tokio::test]
    async fn test_get_all_filters_by_kind_and_principal() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "list");
        let service = child(&clock, TicketKind::Service, "st-list", &mut root);
        let proxy_granting = child(&clock, TicketKind::ProxyGranting, "pgt-list", &mut root);
        registry.add(&root).await.unwrap();
        registry.add(&service).await.unwrap();
        registry.add(&proxy_granting).await.unwrap();

        let all: Vec<Ticket> = registry
            .get_all(TicketFilter::all())
            .map(|ticket| ticket.unwrap())
            .collect()
            .await;
        assert_eq!(all.len(), 3);

        assert_eq!(registry.count(TicketFilter::kind(TicketKind::Service)).await.unwrap(), 1);
        assert_eq!(registry.count(TicketFilter::kind(TicketKind::Proxy)).await.unwrap(), 0);
        assert_eq!(
            registry
                .count(TicketFilter::all().with_principal("someone-else"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_corrupt_entries_are_absent_and_counted() {
        let clock = clock();
        let storage = MemoryTicketStorage::new();
        let registry = registry(storage.clone(), &clock);
        let id = TicketId::parse("ST-1-corrupt").unwrap();
        storage.insert_raw(&registry.storage_key(&id), vec![0xde, 0xad]);

        let result = registry.get(&id).await;
        assert!(matches!(result, Err(TicketError::TicketNotFound { .. })));
        assert_eq!(registry.count(TicketFilter::all()).await.unwrap(), 0);
        assert_eq!(registry.stats().await.unwrap().corrupt_entries, 2);

        assert_eq!(registry.sweep().await.unwrap(), 1);
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_orphans_idempotently() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        let mut root = tgt(&clock, "sweep");
        let service = child(&clock, TicketKind::Service, "st-sweep", &mut root);
        let access = child(&clock, TicketKind::AccessToken, "at-sweep", &mut root);
        let other = tgt(&clock, "survivor");
        registry.add(&root).await.unwrap();
        registry.add(&service).await.unwrap();
        registry.add(&access).await.unwrap();
        registry.add(&other).await.unwrap();

        clock.advance(TimeDelta::seconds(30));
        // Only the service ticket has run out.
        assert_eq!(registry.sweep().await.unwrap(), 1);

        registry.delete(root.id()).await.unwrap();
        // The access token lost its parent.
        assert_eq!(registry.sweep().await.unwrap(), 1);
        assert_eq!(registry.sweep().await.unwrap(), 0);

        assert_eq!(registry.stats().await.unwrap().session_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_all_flushes() {
        let clock = clock();
        let registry = registry(MemoryTicketStorage::new(), &clock);
        registry.add(&tgt(&clock, "a")).await.unwrap();
        registry.add(&tgt(&clock, "b")).await.unwrap();

        assert_eq!(registry.delete_all().await.unwrap(), 2);
        assert_eq!(registry.stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_sealed_codec_registry() {
        let clock = clock();
        let storage = MemoryTicketStorage::new();
        let registry = TicketRegistry::new(
            storage.clone(),
            Arc::new(SealedTicketCodec::new(&[3u8; 32]).unwrap()),
            clock.clone(),
            RegistryConfig::default(),
        );
        let root = tgt(&clock, "sealed");
        registry.add(&root).await.unwrap();

        assert_eq!(registry.get(root.id()).await.unwrap(), root);
        assert!(!registry.storage_key(root.id()).contains("sealed"));
        assert_eq!(registry.stats().await.unwrap().session_count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_not_not_found() {
        let registry = TicketRegistry::new(
            UnavailableStorage,
            Arc::new(PlainTicketCodec),
            clock(),
            RegistryConfig::default(),
        );
        let id = TicketId::parse("ST-1-down").unwrap();

        assert!(matches!(
            registry.get(&id).await,
            Err(TicketError::RegistryUnavailable { .. })
        ));
        assert!(matches!(
            registry.consume(&id).await,
            Err(TicketError::RegistryUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let registry = TicketRegistry::new(
            SlowStorage::new(MemoryTicketStorage::new(), Duration::from_millis(200)),
            Arc::new(PlainTicketCodec),
            clock(),
            RegistryConfig::default().with_operation_timeout(Duration::from_millis(20)),
        );
        let id = TicketId::parse("TGT-1-slow").unwrap();

        assert!(matches!(
            registry.get(&id).await,
            Err(TicketError::RegistryUnavailable { .. })
        ));
    }
}
