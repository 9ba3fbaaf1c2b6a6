//! Service resolver trait.

use crate::error::Result;
use crate::ticket::Service;

/// Answers whether a relying party may receive or present tickets.
///
/// Backed by the deployment's service registry. A `false` answer is a hard
/// failure: tickets are neither minted for nor validated against the service.
pub trait ServiceResolver: Send + Sync {
    /// Check that `service` is registered and enabled.
    ///
    /// # Errors
    ///
    /// Returns error if the service registry cannot be reached.
    fn is_known_and_enabled(
        &self,
        service: &Service,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;
}
