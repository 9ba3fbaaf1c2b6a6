//! # SSO Ticket Lifecycle Engine
//!
//! Issues, chains, stores, validates and expires the tickets of a single
//! sign-on server: ticket-granting tickets (login sessions), service and
//! proxy tickets, and OAuth codes and tokens.
//!
//! ## Features
//!
//! - **Chained**: every ticket descends from a ticket-granting ticket; logout
//!   expires the whole chain at once
//! - **Replay-safe**: single-use tickets are consumed with an atomic backend
//!   operation, so at most one presentation succeeds
//! - **Pluggable storage**: in-memory and `Redis` adapters behind one trait
//! - **Honest failures**: an unreachable backend is never reported as a
//!   missing ticket
//!
//! ## Architecture
//!
//! ```text
//! TicketFactory ──mint──▶ TicketRegistry ◀──consume── TicketValidator
//!                               │
//!                          TicketCodec
//!                               │
//!                         TicketStorage (memory | redis)
//!                               ▲
//!                         TicketSweeper
//! ```
//!
//! ## Example: Service Ticket Round Trip
//!
//! ```rust,ignore
//! use sso_tickets::*;
//!
//! let tgt = factory.create_ticket_granting_ticket(authentication).await?;
//! let st = factory.grant_service_ticket(tgt.id(), service.clone()).await?;
//!
//! let validated = validator.validate_service_ticket(st.id().as_str(), &service).await?;
//! assert_eq!(validated.authentication().principal_id, "casuser");
//!
//! // Logout: every ticket issued under the session goes with it.
//! registry.delete_with_children(tgt.id()).await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

// Public modules
pub mod codec;
pub mod config;
pub mod constants;
pub mod environment;
pub mod error;
pub mod expiration;
pub mod factory;
pub mod providers;
pub mod registry;
pub mod stores;
pub mod sweeper;
pub mod ticket;
pub mod validation;

// Mock implementations for testing
#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-exports
pub use codec::{PlainTicketCodec, SealedTicketCodec, TicketCodec, TicketIdGenerator};
pub use config::{IdGeneratorConfig, RegistryConfig, SweepConfig, TicketPolicies};
pub use environment::{Clock, SystemClock};
pub use error::{Result, TicketError};
pub use expiration::ExpirationPolicy;
pub use factory::{MintRequest, TicketFactory, TokenGrant};
pub use registry::{RegistryStats, TicketFilter, TicketRegistry};
pub use sweeper::{SweeperHandle, TicketSweeper};
pub use ticket::{Authentication, Service, Ticket, TicketId, TicketKind};
pub use validation::TicketValidator;
