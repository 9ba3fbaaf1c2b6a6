//! Error types for ticket issuance, storage and validation.

use thiserror::Error;

/// Result type alias for ticket operations.
pub type Result<T> = std::result::Result<T, TicketError>;

/// Error taxonomy for the ticket lifecycle.
///
/// "Not found" and "registry unreachable" are deliberately separate variants:
/// callers must never mistake a storage outage for a mass logout.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TicketError {
    // ═══════════════════════════════════════════════════════════
    // Presentation Errors
    // ═══════════════════════════════════════════════════════════

    /// Malformed ticket ID, wrong ticket type, or a parent that cannot be chained from.
    #[error("Invalid ticket: {reason}")]
    InvalidTicket {
        /// Why the ticket was rejected
        reason: String,
    },

    /// Ticket is absent from the registry (never issued or already evicted).
    #[error("Ticket not found: {id}")]
    TicketNotFound {
        /// Presented ticket ID
        id: String,
    },

    /// Ticket exists but its policy, sticky flag or governing ticket says it is dead.
    #[error("Ticket has expired: {id}")]
    TicketExpired {
        /// Presented ticket ID
        id: String,
    },

    /// Single-use ticket presented a second time.
    #[error("Ticket has already been consumed: {id}")]
    AlreadyConsumed {
        /// Presented ticket ID
        id: String,
    },

    /// Ticket was issued for a different relying party.
    #[error("Ticket {id} was not issued for service {service}")]
    ServiceMismatch {
        /// Presented ticket ID
        id: String,
        /// Service the ticket was presented against
        service: String,
    },

    // ═══════════════════════════════════════════════════════════
    // Issuance Errors
    // ═══════════════════════════════════════════════════════════

    /// Generated ID collided with a stored ticket.
    #[error("Duplicate ticket ID: {id}")]
    DuplicateTicket {
        /// Colliding ticket ID
        id: String,
    },

    /// Service is unknown to the service registry or disabled.
    #[error("Service is not authorized: {service}")]
    ServiceNotAuthorized {
        /// Rejected service identifier
        service: String,
    },

    /// Granting ticket reached its issuance limit for the current window.
    #[error("Too many tickets issued by {id}, retry after {retry_after:?}")]
    IssuanceThrottled {
        /// Granting ticket ID
        id: String,
        /// Time until the oldest issuance leaves the window
        retry_after: std::time::Duration,
    },

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// Storage backend unreachable or timed out.
    #[error("Ticket registry unavailable: {reason}")]
    RegistryUnavailable {
        /// Backend failure description
        reason: String,
    },

    /// Stored payload could not be decoded (corruption, tampering, wrong key).
    #[error("Corrupt ticket payload: {reason}")]
    CorruptTicket {
        /// Decode failure description
        reason: String,
    },

    /// Component constructed with unusable parameters.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl TicketError {
    /// Shorthand for [`TicketError::InvalidTicket`].
    #[must_use]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidTicket {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`TicketError::RegistryUnavailable`].
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::RegistryUnavailable {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`TicketError::CorruptTicket`].
    #[must_use]
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptTicket {
            reason: reason.into(),
        }
    }

    /// Returns `true` if the presenting client is at fault.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sso_tickets::TicketError;
    /// assert!(TicketError::TicketNotFound { id: "ST-1".into() }.is_client_error());
    /// assert!(!TicketError::unavailable("timeout").is_client_error());
    /// ```
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidTicket { .. }
                | Self::TicketNotFound { .. }
                | Self::TicketExpired { .. }
                | Self::AlreadyConsumed { .. }
                | Self::ServiceMismatch { .. }
                | Self::ServiceNotAuthorized { .. }
                | Self::IssuanceThrottled { .. }
        )
    }

    /// Returns `true` if this error indicates a possible attack.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sso_tickets::TicketError;
    /// assert!(TicketError::AlreadyConsumed { id: "ST-1".into() }.is_security_issue());
    /// assert!(!TicketError::TicketExpired { id: "ST-1".into() }.is_security_issue());
    /// ```
    #[must_use]
    pub const fn is_security_issue(&self) -> bool {
        matches!(
            self,
            Self::AlreadyConsumed { .. }
                | Self::ServiceMismatch { .. }
                | Self::CorruptTicket { .. }
                | Self::DuplicateTicket { .. }
        )
    }

    /// OAuth 2.0 error code a token endpoint would report for this error.
    #[must_use]
    pub const fn oauth_error_code(&self) -> &'static str {
        match self {
            Self::InvalidTicket { .. } => "invalid_request",
            Self::TicketNotFound { .. }
            | Self::TicketExpired { .. }
            | Self::AlreadyConsumed { .. }
            | Self::ServiceMismatch { .. } => "invalid_grant",
            Self::ServiceNotAuthorized { .. } => "unauthorized_client",
            Self::IssuanceThrottled { .. } | Self::RegistryUnavailable { .. } => {
                "temporarily_unavailable"
            }
            Self::DuplicateTicket { .. }
            | Self::CorruptTicket { .. }
            | Self::InvalidConfiguration(_) => "server_error",
        }
    }
}
