//! Storage doubles for failure-mode tests.

use crate::error::{Result, TicketError};
use crate::providers::TicketStorage;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Backend that is never reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStorage;

impl UnavailableStorage {
    fn refused<T>() -> Result<T> {
        Err(TicketError::unavailable("connection refused"))
    }
}

impl TicketStorage for UnavailableStorage {
    async fn put(&self, _key: &str, _blob: Vec<u8>, _ttl_hint: Option<Duration>) -> Result<()> {
        Self::refused()
    }

    async fn put_if_absent(
        &self,
        _key: &str,
        _blob: Vec<u8>,
        _ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        Self::refused()
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: &[u8],
        _blob: Vec<u8>,
        _ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        Self::refused()
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Self::refused()
    }

    async fn delete(&self, _key: &str) -> Result<bool> {
        Self::refused()
    }

    async fn take(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Self::refused()
    }

    async fn scan(&self, _prefix: &str) -> Result<Vec<String>> {
        Self::refused()
    }

    async fn clear(&self, _prefix: &str) -> Result<usize> {
        Self::refused()
    }
}

/// Backend that answers every call after a fixed delay.
#[derive(Debug, Clone)]
pub struct SlowStorage<S> {
    inner: S,
    delay: Duration,
}

impl<S> SlowStorage<S> {
    /// Wrap `inner`, delaying each call by `delay`.
    #[must_use]
    pub const fn new(inner: S, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl<S: TicketStorage> TicketStorage for SlowStorage<S> {
    async fn put(&self, key: &str, blob: Vec<u8>, ttl_hint: Option<Duration>) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(key, blob, ttl_hint).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.put_if_absent(key, blob, ttl_hint).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.compare_and_swap(key, expected, blob, ttl_hint).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        tokio::time::sleep(self.delay).await;
        self.inner.delete(key).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.take(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        tokio::time::sleep(self.delay).await;
        self.inner.scan(prefix).await
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        tokio::time::sleep(self.delay).await;
        self.inner.clear(prefix).await
    }
}

/// Backend whose writes can be switched to fail.
///
/// Reads and deletes always delegate to the wrapped store, so tests can make a
/// write fail halfway through a multi-step operation.
#[derive(Debug, Clone)]
pub struct FaultyStorage<S> {
    inner: S,
    fail_inserts: Arc<AtomicBool>,
    fail_updates: Arc<AtomicBool>,
}

impl<S> FaultyStorage<S> {
    /// Wrap `inner` with every write succeeding.
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_inserts: Arc::new(AtomicBool::new(false)),
            fail_updates: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent `put_if_absent` calls fail (or succeed again).
    pub fn fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `put` and `compare_and_swap` calls fail (or succeed again).
    pub fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(TicketError::unavailable("write rejected"))
        } else {
            Ok(())
        }
    }
}

impl<S: TicketStorage> TicketStorage for FaultyStorage<S> {
    async fn put(&self, key: &str, blob: Vec<u8>, ttl_hint: Option<Duration>) -> Result<()> {
        Self::check(&self.fail_updates)?;
        self.inner.put(key, blob, ttl_hint).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        Self::check(&self.fail_inserts)?;
        self.inner.put_if_absent(key, blob, ttl_hint).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        Self::check(&self.fail_updates)?;
        self.inner.compare_and_swap(key, expected, blob, ttl_hint).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.take(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.scan(prefix).await
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        self.inner.clear(prefix).await
    }
}
