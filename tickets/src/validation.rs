//! Ticket validation.
//!
//! The protocol-facing check a relying party triggers when it presents a
//! ticket. Checks run cheapest first. A single-use ticket presented against
//! the wrong service is burnt rather than left for another attempt; a
//! multi-use ticket is refused without recording a use.

use crate::error::{Result, TicketError};
use crate::providers::{ServiceResolver, TicketStorage};
use crate::registry::TicketRegistry;
use crate::ticket::{Service, Ticket, TicketId, TicketKind};
use std::sync::Arc;

/// Validates presented tickets.
pub struct TicketValidator<S, V> {
    registry: TicketRegistry<S>,
    resolver: Arc<V>,
}

impl<S, V> TicketValidator<S, V>
where
    S: TicketStorage,
    V: ServiceResolver,
{
    /// Create a validator.
    #[must_use]
    pub const fn new(registry: TicketRegistry<S>, resolver: Arc<V>) -> Self {
        Self { registry, resolver }
    }

    /// Validate a ticket of `expected_kind` presented by `service`.
    ///
    /// On success the use is recorded exactly once and the ticket is returned
    /// with its authentication snapshot (the principal).
    ///
    /// # Errors
    ///
    /// - `TicketError::InvalidTicket` if the ID is malformed or of another kind
    /// - `TicketError::ServiceNotAuthorized` if `service` is unknown or disabled
    /// - `TicketError::TicketNotFound`, `AlreadyConsumed` or `TicketExpired`
    ///   from [`TicketRegistry::consume_bound`]
    /// - `TicketError::ServiceMismatch` if the ticket was issued for another service
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let ticket = validator
    ///     .validate(&presented, TicketKind::Service, &Service::new("https://app.example.com"))
    ///     .await?;
    /// println!("authenticated {}", ticket.authentication().principal_id);
    /// ```
    pub async fn validate(
        &self,
        raw_id: &str,
        expected_kind: TicketKind,
        service: &Service,
    ) -> Result<Ticket> {
        self.validate_one_of(raw_id, &[expected_kind], service).await
    }

    /// Validate a service ticket (`/serviceValidate`).
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub async fn validate_service_ticket(&self, raw_id: &str, service: &Service) -> Result<Ticket> {
        self.validate(raw_id, TicketKind::Service, service).await
    }

    /// Validate a service or proxy ticket (`/proxyValidate`).
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub async fn validate_proxy_ticket(&self, raw_id: &str, service: &Service) -> Result<Ticket> {
        self.validate_one_of(raw_id, &[TicketKind::Service, TicketKind::Proxy], service)
            .await
    }

    /// Validate a ticket whose kind is any of `kinds`.
    ///
    /// # Errors
    ///
    /// As [`validate`](Self::validate).
    pub async fn validate_one_of(
        &self,
        raw_id: &str,
        kinds: &[TicketKind],
        service: &Service,
    ) -> Result<Ticket> {
        let id = TicketId::parse(raw_id)?;

        if !kinds.contains(&id.kind()) {
            tracing::debug!(ticket_id = %id, expected = ?kinds, "Ticket of unexpected kind presented");
            return Err(TicketError::invalid(format!(
                "{} tickets are not accepted here",
                id.kind()
            )));
        }

        if !self.resolver.is_known_and_enabled(service).await? {
            tracing::warn!(ticket_id = %id, service = %service, "Validation by unauthorized service");
            return Err(TicketError::ServiceNotAuthorized {
                service: service.to_string(),
            });
        }

        let ticket = match self.registry.consume_bound(&id, service).await {
            Ok(ticket) => ticket,
            Err(e @ TicketError::ServiceMismatch { .. }) => {
                metrics::counter!("tickets.validation.service_mismatch").increment(1);
                tracing::warn!(
                    ticket_id = %id,
                    presented = %service,
                    "Ticket presented by the wrong service"
                );
                return Err(e);
            }
            Err(e) => {
                metrics::counter!("tickets.validation.failed", "reason" => e.oauth_error_code())
                    .increment(1);
                tracing::info!(ticket_id = %id, service = %service, error = %e, "Ticket validation failed");
                return Err(e);
            }
        };

        tracing::info!(
            ticket_id = %id,
            principal = %ticket.authentication().principal_id,
            service = %service,
            "Ticket validated"
        );
        Ok(ticket)
    }
}
