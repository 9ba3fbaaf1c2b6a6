//! Ticket factory.
//!
//! The factory is the chaining authority: every ticket is minted here, and a
//! child is only minted off a live parent that is allowed to grant its kind.
//! Recording the child in the parent's descendant set and storing the child
//! form one logical unit. The parent is updated first, through a conditional
//! write that re-checks it against its current stored version, so a logout
//! racing the mint either stops it or is kept. If the child then cannot be
//! stored, it is removed from the parent again.

use crate::codec::TicketIdGenerator;
use crate::config::TicketPolicies;
use crate::error::{Result, TicketError};
use crate::expiration::ExpirationPolicy;
use crate::providers::{ServiceResolver, TicketStorage};
use crate::registry::TicketRegistry;
use crate::ticket::{Authentication, Service, Ticket, TicketId, TicketKind};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Parameters of one mint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintRequest {
    /// Kind of ticket to mint.
    pub kind: TicketKind,

    /// Granting ticket. Required for every kind except ticket-granting tickets.
    pub parent: Option<TicketId>,

    /// Explicit policy; otherwise taken from the factory's [`TicketPolicies`].
    pub policy: Option<ExpirationPolicy>,

    /// Relying party the ticket is bound to.
    pub service: Option<Service>,

    /// Authentication snapshot; children default to their parent's.
    pub authentication: Option<Authentication>,

    /// OAuth scopes.
    pub scopes: BTreeSet<String>,

    /// Override of the single-use flag derived from the kind.
    pub single_use: Option<bool>,
}

impl MintRequest {
    /// Request a ticket of `kind`.
    #[must_use]
    pub const fn new(kind: TicketKind) -> Self {
        Self {
            kind,
            parent: None,
            policy: None,
            service: None,
            authentication: None,
            scopes: BTreeSet::new(),
            single_use: None,
        }
    }

    /// Set the granting ticket.
    #[must_use]
    pub fn with_parent(mut self, parent: TicketId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set an explicit expiration policy.
    #[must_use]
    pub fn with_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Bind the ticket to a service.
    #[must_use]
    pub fn with_service(mut self, service: Service) -> Self {
        self.service = Some(service);
        self
    }

    /// Set the authentication snapshot.
    #[must_use]
    pub fn with_authentication(mut self, authentication: Authentication) -> Self {
        self.authentication = Some(authentication);
        self
    }

    /// Set OAuth scopes.
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Override the single-use flag.
    #[must_use]
    pub const fn with_single_use(mut self, single_use: bool) -> Self {
        self.single_use = Some(single_use);
        self
    }
}

/// Tokens issued by an OAuth code exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New access token.
    pub access_token: Ticket,
    /// New refresh token, when requested.
    pub refresh_token: Option<Ticket>,
}

/// Mints tickets and maintains the chain between them.
pub struct TicketFactory<S, V> {
    registry: TicketRegistry<S>,
    resolver: Arc<V>,
    generator: TicketIdGenerator,
    policies: TicketPolicies,
}

impl<S, V> TicketFactory<S, V>
where
    S: TicketStorage,
    V: ServiceResolver,
{
    /// Create a factory.
    #[must_use]
    pub const fn new(
        registry: TicketRegistry<S>,
        resolver: Arc<V>,
        generator: TicketIdGenerator,
        policies: TicketPolicies,
    ) -> Self {
        Self {
            registry,
            resolver,
            generator,
            policies,
        }
    }

    /// Registry tickets are stored in.
    #[must_use]
    pub const fn registry(&self) -> &TicketRegistry<S> {
        &self.registry
    }

    /// Policies applied to new tickets.
    #[must_use]
    pub const fn policies(&self) -> &TicketPolicies {
        &self.policies
    }

    /// Mint and store a ticket.
    ///
    /// Nothing is written unless every check passes.
    ///
    /// # Errors
    ///
    /// - `TicketError::InvalidTicket` if the parent is missing, expired, or may
    ///   not grant this kind, or required inputs are absent
    /// - `TicketError::ServiceNotAuthorized` if the service is unknown or disabled
    /// - `TicketError::IssuanceThrottled` if the parent's issuance limit is reached
    /// - `TicketError::DuplicateTicket` on an ID collision
    /// - `TicketError::RegistryUnavailable` if the backend fails or times out
    pub async fn mint(&self, request: MintRequest) -> Result<Ticket> {
        let now = self.registry.now();
        let kind = request.kind;

        let parent = match (kind, &request.parent) {
            (TicketKind::TicketGranting, Some(_)) => {
                return Err(TicketError::invalid("ticket-granting tickets have no parent"));
            }
            (TicketKind::TicketGranting, None) => None,
            (_, None) => {
                return Err(TicketError::invalid(format!("{kind} tickets need a parent")));
            }
            (_, Some(parent_id)) => Some(self.granting_parent(parent_id, kind).await?),
        };

        let service = if kind.requires_service() {
            let Some(service) = request.service else {
                return Err(TicketError::invalid(format!("{kind} tickets need a service")));
            };
            self.authorize(&service).await?;
            Some(service)
        } else {
            None
        };

        let authentication = match (request.authentication, &parent) {
            (Some(authentication), _) => authentication,
            (None, Some(parent)) => parent.authentication().clone(),
            (None, None) => {
                return Err(TicketError::invalid(
                    "ticket-granting tickets need an authentication",
                ));
            }
        };

        let policy = request
            .policy
            .unwrap_or_else(|| self.policies.policy_for(kind, service.as_ref()));

        let mut ticket = Ticket::new(
            self.generator.new_ticket_id(kind)?,
            now,
            policy,
            parent.as_ref().map(|parent| parent.id().clone()),
            service,
            authentication,
        )
        .with_scopes(request.scopes);
        if let Some(single_use) = request.single_use {
            ticket = ticket.with_single_use(single_use);
        }

        if let Some(parent) = &parent {
            self.link(parent.id(), &ticket, now).await?;
        }

        if let Err(e) = self.registry.add(&ticket).await {
            if let Some(parent) = &parent {
                self.unlink(parent.id(), ticket.id()).await;
            }
            return Err(e);
        }

        metrics::counter!("tickets.factory.minted", "kind" => kind.prefix()).increment(1);
        tracing::info!(
            ticket_id = %ticket.id(),
            kind = ?kind,
            parent = ?ticket.parent().map(TicketId::as_str),
            principal = %ticket.authentication().principal_id,
            "Ticket minted"
        );

        Ok(ticket)
    }

    async fn granting_parent(&self, parent_id: &TicketId, kind: TicketKind) -> Result<Ticket> {
        if !parent_id.kind().can_grant(kind) {
            return Err(TicketError::invalid(format!(
                "{} tickets cannot grant {kind} tickets",
                parent_id.kind()
            )));
        }

        let Some(parent) = self.registry.load(parent_id).await? else {
            return Err(TicketError::invalid(format!("parent {parent_id} does not exist")));
        };

        if self.registry.is_expired(&parent).await? {
            tracing::info!(parent = %parent_id, kind = ?kind, "Refused to chain from expired ticket");
            return Err(TicketError::invalid(format!("parent {parent_id} has expired")));
        }

        Ok(parent)
    }

    async fn authorize(&self, service: &Service) -> Result<()> {
        if self.resolver.is_known_and_enabled(service).await? {
            Ok(())
        } else {
            tracing::warn!(service = %service, "Ticket requested for unauthorized service");
            Err(TicketError::ServiceNotAuthorized {
                service: service.to_string(),
            })
        }
    }

    fn check_throttle(parent: &Ticket, now: DateTime<Utc>) -> Result<()> {
        let issued = parent.descendants().values().copied();
        match parent
            .expiration_policy()
            .issuance_retry_after(&parent.usage(), issued, now)
        {
            None => Ok(()),
            Some(retry_after) => Err(TicketError::IssuanceThrottled {
                id: parent.id().to_string(),
                retry_after,
            }),
        }
    }

    /// Record `child` on the current stored version of its parent.
    ///
    /// The parent's own expiry and issuance limit are checked against that
    /// version, so concurrent mints and logouts all count.
    async fn link(&self, parent_id: &TicketId, child: &Ticket, now: DateTime<Utc>) -> Result<()> {
        let linked = self
            .registry
            .modify(parent_id, |parent| {
                if parent.is_expired_at(now) {
                    return Err(TicketError::invalid(format!("parent {parent_id} has expired")));
                }
                Self::check_throttle(parent, now)?;
                parent.add_descendant(child.id().clone(), now);
                parent.update(now);
                Ok(())
            })
            .await;

        match linked {
            Ok(_) => Ok(()),
            Err(TicketError::TicketNotFound { .. }) => {
                Err(TicketError::invalid(format!("parent {parent_id} does not exist")))
            }
            Err(e @ TicketError::IssuanceThrottled { retry_after, .. }) => {
                metrics::counter!("tickets.factory.throttled").increment(1);
                tracing::warn!(
                    parent = %parent_id,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Ticket issuance throttled"
                );
                Err(e)
            }
            Err(e) => {
                tracing::info!(parent = %parent_id, child = %child.id(), error = %e, "Parent refused the child");
                Err(e)
            }
        }
    }

    /// Remove a child that could not be stored from its parent.
    async fn unlink(&self, parent_id: &TicketId, child_id: &TicketId) {
        let unlinked = self
            .registry
            .modify(parent_id, |parent| {
                parent.remove_descendant(child_id);
                Ok(())
            })
            .await;

        match unlinked {
            Ok(_) => {
                tracing::warn!(parent = %parent_id, child = %child_id, "Child not stored, unlinked from parent");
            }
            // A parent deleted meanwhile has nothing left to unlink.
            Err(TicketError::TicketNotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    parent = %parent_id,
                    child = %child_id,
                    error = %e,
                    "Unlinking unstored child failed"
                );
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────
    // Protocol helpers
    // ───────────────────────────────────────────────────────────────────

    /// Start a login session.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn create_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> Result<Ticket> {
        self.mint(MintRequest::new(TicketKind::TicketGranting).with_authentication(authentication))
            .await
    }

    /// Grant a service ticket off a ticket-granting ticket.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn grant_service_ticket(&self, tgt: &TicketId, service: Service) -> Result<Ticket> {
        self.mint(
            MintRequest::new(TicketKind::Service)
                .with_parent(tgt.clone())
                .with_service(service),
        )
        .await
    }

    /// Grant a proxy-granting ticket to a proxying service.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn grant_proxy_granting_ticket(
        &self,
        tgt: &TicketId,
        proxy_callback: Service,
    ) -> Result<Ticket> {
        self.mint(
            MintRequest::new(TicketKind::ProxyGranting)
                .with_parent(tgt.clone())
                .with_service(proxy_callback),
        )
        .await
    }

    /// Grant a proxy ticket off a proxy-granting ticket.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn grant_proxy_ticket(&self, pgt: &TicketId, target: Service) -> Result<Ticket> {
        self.mint(
            MintRequest::new(TicketKind::Proxy)
                .with_parent(pgt.clone())
                .with_service(target),
        )
        .await
    }

    /// Issue an OAuth authorization code.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn create_authorization_code<I, T>(
        &self,
        tgt: &TicketId,
        client: Service,
        scopes: I,
    ) -> Result<Ticket>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.mint(
            MintRequest::new(TicketKind::OAuthCode)
                .with_parent(tgt.clone())
                .with_service(client)
                .with_scopes(scopes),
        )
        .await
    }

    /// Issue an OAuth access token.
    ///
    /// `parent` is a ticket-granting ticket or a refresh token.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn create_access_token<I, T>(
        &self,
        parent: &TicketId,
        client: Service,
        scopes: I,
    ) -> Result<Ticket>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.mint(
            MintRequest::new(TicketKind::AccessToken)
                .with_parent(parent.clone())
                .with_service(client)
                .with_scopes(scopes),
        )
        .await
    }

    /// Issue an OAuth refresh token.
    ///
    /// Sovereign when the factory's policies say so.
    ///
    /// # Errors
    ///
    /// As [`mint`](Self::mint).
    pub async fn create_refresh_token<I, T>(
        &self,
        tgt: &TicketId,
        client: Service,
        scopes: I,
    ) -> Result<Ticket>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.mint(
            MintRequest::new(TicketKind::RefreshToken)
                .with_parent(tgt.clone())
                .with_service(client)
                .with_scopes(scopes),
        )
        .await
    }

    /// Redeem an authorization code for tokens.
    ///
    /// The code is consumed first, so a replayed code never yields tokens.
    /// The tokens are chained under the code's ticket-granting ticket and carry
    /// the code's scopes.
    ///
    /// # Errors
    ///
    /// - `TicketError::InvalidTicket` if `code` is not an authorization code
    /// - `TicketError::AlreadyConsumed` if the code was already redeemed
    /// - `TicketError::ServiceMismatch` if the code belongs to another client
    /// - otherwise as [`consume_bound`](TicketRegistry::consume_bound) and [`mint`](Self::mint)
    pub async fn exchange_authorization_code(
        &self,
        code: &TicketId,
        client: &Service,
        issue_refresh_token: bool,
    ) -> Result<TokenGrant> {
        if code.kind() != TicketKind::OAuthCode {
            return Err(TicketError::invalid(format!("{code} is not an authorization code")));
        }

        let redeemed = self.registry.consume_bound(code, client).await?;

        let Some(tgt) = redeemed.parent() else {
            return Err(TicketError::invalid(format!("{code} has no granting ticket")));
        };

        let scopes = redeemed.scopes().clone();
        let access_token = self
            .create_access_token(tgt, client.clone(), scopes.iter().cloned())
            .await?;

        let refresh_token = if issue_refresh_token {
            match self.create_refresh_token(tgt, client.clone(), scopes).await {
                Ok(refresh_token) => Some(refresh_token),
                Err(e) => {
                    self.registry.delete(access_token.id()).await?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::info!(
            code = %code,
            access_token = %access_token.id(),
            refresh_token = ?refresh_token.as_ref().map(|t| t.id().as_str()),
            "Authorization code exchanged"
        );

        Ok(TokenGrant {
            access_token,
            refresh_token,
        })
    }

    /// Issue a new access token from a refresh token.
    ///
    /// The access token is chained under the refresh token, so revoking the
    /// refresh token also revokes every access token it produced.
    ///
    /// # Errors
    ///
    /// - `TicketError::InvalidTicket` if `refresh_token` is not a refresh token
    /// - `TicketError::TicketExpired` if the refresh token has expired
    /// - `TicketError::ServiceMismatch` if it belongs to another client
    /// - otherwise as [`consume_bound`](TicketRegistry::consume_bound) and [`mint`](Self::mint)
    pub async fn refresh_access_token(
        &self,
        refresh_token: &TicketId,
        client: &Service,
    ) -> Result<Ticket> {
        if refresh_token.kind() != TicketKind::RefreshToken {
            return Err(TicketError::invalid(format!("{refresh_token} is not a refresh token")));
        }

        let refresh = self.registry.consume_bound(refresh_token, client).await?;

        self.create_access_token(refresh_token, client.clone(), refresh.scopes().iter().cloned())
            .await
    }
}
