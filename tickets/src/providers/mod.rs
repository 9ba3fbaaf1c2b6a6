//! Ticket engine providers.
//!
//! Traits for the external collaborators the engine talks to. Providers are
//! interfaces, not implementations:
//!
//! - **Testing**: in-memory mocks from [`crate::mocks`]
//! - **Production**: backend adapters from [`crate::stores`] and the
//!   deployment's service registry

pub mod services;
pub mod storage;

pub use services::ServiceResolver;
pub use storage::TicketStorage;
