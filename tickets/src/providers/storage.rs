//! Ticket storage backend trait.
//!
//! This is the narrow key/value surface a backend adapter exposes to the
//! registry. Keys are strings chosen by the registry, values are opaque blobs
//! produced by a [`TicketCodec`](crate::codec::TicketCodec).

use crate::error::Result;
use std::time::Duration;

/// Key/value backend for encoded tickets.
///
/// # Implementation Notes
///
/// - `ttl_hint` is an upper bound on how long the entry is useful. Backends
///   may evict after it elapses; they must not evict before.
/// - **CRITICAL**: `take()`, `put_if_absent()` and `compare_and_swap()` MUST
///   be atomic per key (`Redis`: `GETDEL` / `SET NX` / a Lua script; in-memory:
///   per-key guarded map operations). Single-use consumption is only as strong
///   as `take()`, and every read-modify-write of a stored ticket only as strong
///   as `compare_and_swap()`.
/// - Connectivity failures MUST surface as `TicketError::RegistryUnavailable`,
///   never as a missing key.
pub trait TicketStorage: Send + Sync {
    /// Store `blob` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn put(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Store `blob` under `key` only if the key is absent.
    ///
    /// # Returns
    ///
    /// `true` if stored, `false` if the key already existed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn put_if_absent(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Replace the value under `key` with `blob`, but only if it currently
    /// holds exactly `expected`.
    ///
    /// A missing key never matches, so a deleted entry is not resurrected.
    ///
    /// # Returns
    ///
    /// `true` if swapped, `false` if the key was absent or held other bytes.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Fetch the blob stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn get(&self, key: &str) -> impl std::future::Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete `key`.
    ///
    /// # Returns
    ///
    /// `true` if a value was removed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn delete(&self, key: &str) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Atomically remove `key` and return its value.
    ///
    /// Of any number of concurrent callers, at most one receives `Some`.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn take(&self, key: &str) -> impl std::future::Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// List keys starting with `prefix`.
    ///
    /// The listing is a point-in-time view; entries may disappear before they
    /// are fetched.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn scan(&self, prefix: &str) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;

    /// Delete every key starting with `prefix`.
    ///
    /// # Returns
    ///
    /// Number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the backend fails.
    fn clear(&self, prefix: &str) -> impl std::future::Future<Output = Result<usize>> + Send;
}
