//! In-memory ticket storage.
//!
//! The reference backend adapter. Entries live in a sharded concurrent map, so
//! every operation on one key runs under that key's shard lock: `take` and
//! `put_if_absent` are atomic, and single-use consumption is linearizable for
//! all callers in this process. It offers nothing across processes; a cluster
//! needs a shared backend such as [`RedisTicketStorage`](super::RedisTicketStorage).

use crate::error::Result;
use crate::providers::TicketStorage;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct StoredBlob {
    blob: Vec<u8>,
    deadline: Option<Instant>,
}

impl StoredBlob {
    fn new(blob: Vec<u8>, ttl_hint: Option<Duration>) -> Self {
        Self {
            blob,
            deadline: ttl_hint.and_then(|ttl| Instant::now().checked_add(ttl)),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }
}

/// In-memory ticket storage honouring TTL hints.
///
/// Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryTicketStorage {
    entries: Arc<DashMap<String, StoredBlob>>,
}

impl MemoryTicketStorage {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries (for tests and diagnostics).
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.value().is_live(now)).count()
    }

    /// Whether the store holds no live entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the raw blob under `key`, bypassing any codec (for tests that
    /// simulate corruption).
    pub fn insert_raw(&self, key: &str, blob: Vec<u8>) {
        self.entries.insert(key.to_string(), StoredBlob::new(blob, None));
    }
}

impl TicketStorage for MemoryTicketStorage {
    async fn put(&self, key: &str, blob: Vec<u8>, ttl_hint: Option<Duration>) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredBlob::new(blob, ttl_hint));
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) if existing.get().is_live(now) => Ok(false),
            Entry::Occupied(mut stale) => {
                stale.insert(StoredBlob::new(blob, ttl_hint));
                Ok(true)
            }
            Entry::Vacant(slot) => {
                slot.insert(StoredBlob::new(blob, ttl_hint));
                Ok(true)
            }
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut current)
                if current.get().is_live(now) && current.get().blob == expected =>
            {
                current.insert(StoredBlob::new(blob, ttl_hint));
                Ok(true)
            }
            Entry::Occupied(_) | Entry::Vacant(_) => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        let found = self
            .entries
            .get(key)
            .map(|entry| (entry.is_live(now), entry.blob.clone()));

        match found {
            Some((true, blob)) => Ok(Some(blob)),
            Some((false, _)) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(_, entry)| entry.blob))
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().is_live(now))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        let now = Instant::now();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = keys
            .iter()
            .filter_map(|key| self.entries.remove(key))
            .filter(|(_, entry)| entry.is_live(now))
            .count();

        tracing::debug!(prefix = prefix, removed = removed, "Cleared in-memory ticket storage");
        Ok(removed)
    }
}
