//! Redis-based ticket storage.
//!
//! # Architecture
//!
//! Entries are stored in Redis with:
//! - **Key**: `{namespace}{registry key}`, e.g. `sso:ticket:ST-…`
//! - **Value**: the codec blob, unchanged
//! - **TTL**: the registry's TTL hint in milliseconds (`PX`), never shorter
//!   than the ticket's policy lifetime
//!
//! # Consistency
//!
//! - `put_if_absent` is `SET NX`, `take` is `GETDEL`; both are atomic on the
//!   Redis primary, so concurrent presentations of one single-use ticket
//!   yield exactly one success against a single primary.
//! - `compare_and_swap` runs as one Lua script, so a concurrent delete or
//!   update between its compare and its write is impossible.
//! - With asynchronous replicas and failover, a write acknowledged by a
//!   primary that dies before replicating can be lost. A consumed ticket can
//!   then reappear on the promoted replica until its (seconds-long) TTL runs
//!   out. That window is the replay risk this adapter accepts.
//!
//! # Example
//!
//! ```no_run
//! use sso_tickets::stores::RedisTicketStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = RedisTicketStorage::new("redis://127.0.0.1:6379").await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, TicketError};
use crate::providers::TicketStorage;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Default key namespace.
const DEFAULT_NAMESPACE: &str = "sso:";

/// `KEYS[1]` = key, `ARGV[1]` = expected blob, `ARGV[2]` = new blob,
/// `ARGV[3]` = TTL in milliseconds or `0` for none.
const COMPARE_AND_SWAP_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
else
    redis.call('SET', KEYS[1], ARGV[2])
end
return 1
";

/// `Redis`-backed ticket storage.
///
/// Cloning shares the underlying `ConnectionManager` (connection pool).
#[derive(Clone)]
pub struct RedisTicketStorage {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
    /// Prefix prepended to every key.
    namespace: String,
}

impl RedisTicketStorage {
    /// Create a new `Redis` ticket storage using the default `sso:` namespace.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the URL is malformed or the
    /// connection fails.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::with_namespace(redis_url, DEFAULT_NAMESPACE).await
    }

    /// Create a new `Redis` ticket storage with a custom key namespace.
    ///
    /// # Errors
    ///
    /// Returns `TicketError::RegistryUnavailable` if the URL is malformed or the
    /// connection fails.
    pub async fn with_namespace(redis_url: &str, namespace: impl Into<String>) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| TicketError::unavailable(format!("Failed to create Redis client: {e}")))?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            TicketError::unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        let namespace = namespace.into();
        tracing::info!(namespace = %namespace, "RedisTicketStorage initialized successfully");

        Ok(Self {
            conn_manager,
            namespace,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.namespace)
    }

    /// TTL hint in milliseconds; Redis rejects zero, so clamp to 1 ms.
    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    fn failure(operation: &str, e: &redis::RedisError) -> TicketError {
        TicketError::unavailable(format!("Redis {operation} failed: {e}"))
    }
}

impl TicketStorage for RedisTicketStorage {
    async fn put(&self, key: &str, blob: Vec<u8>, ttl_hint: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        let key = self.key(key);

        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(blob);
        if let Some(ttl) = ttl_hint {
            cmd.arg("PX").arg(Self::ttl_millis(ttl));
        }

        let _: () = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::failure("SET", &e))?;

        tracing::trace!(key = %key, ttl_hint = ?ttl_hint, "Stored ticket entry in Redis");
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let key = self.key(key);

        // SET NX is atomic: existence check and write in one command.
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(blob).arg("NX");
        if let Some(ttl) = ttl_hint {
            cmd.arg("PX").arg(Self::ttl_millis(ttl));
        }

        let reply: Option<String> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| Self::failure("SET NX", &e))?;

        Ok(reply.is_some())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &[u8],
        blob: Vec<u8>,
        ttl_hint: Option<Duration>,
    ) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let key = self.key(key);
        let ttl_millis = ttl_hint.map_or(0, Self::ttl_millis);

        // A missing key reads as false in Lua and never equals a blob.
        let swapped: i64 = redis::Script::new(COMPARE_AND_SWAP_SCRIPT)
            .key(&key)
            .arg(expected)
            .arg(blob)
            .arg(ttl_millis)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Self::failure("EVALSHA", &e))?;

        tracing::trace!(key = %key, swapped = swapped == 1, "Compare-and-swap on Redis entry");
        Ok(swapped == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();
        let blob: Option<Vec<u8>> = conn
            .get(self.key(key))
            .await
            .map_err(|e| Self::failure("GET", &e))?;
        Ok(blob)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let deleted: i64 = conn
            .del(self.key(key))
            .await
            .map_err(|e| Self::failure("DEL", &e))?;
        Ok(deleted > 0)
    }

    async fn take(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn_manager.clone();

        // GETDEL is atomic (get + delete in one operation): of several
        // concurrent callers exactly one receives the value.
        let blob: Option<Vec<u8>> = conn
            .get_del(self.key(key))
            .await
            .map_err(|e| Self::failure("GETDEL", &e))?;
        Ok(blob)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn_manager.clone();
        let pattern = format!("{}*", self.key(prefix));

        let mut keys = Vec::new();
        {
            let mut iter: redis::AsyncIter<'_, String> = conn
                .scan_match(&pattern)
                .await
                .map_err(|e| Self::failure("SCAN", &e))?;

            while let Some(key) = iter.next_item().await {
                if let Some(stripped) = key.strip_prefix(&self.namespace) {
                    keys.push(stripped.to_string());
                }
            }
        }

        Ok(keys)
    }

    async fn clear(&self, prefix: &str) -> Result<usize> {
        let keys = self.scan(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn_manager.clone();
        let namespaced: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        let removed: usize = conn
            .del(namespaced)
            .await
            .map_err(|e| Self::failure("DEL", &e))?;

        tracing::info!(prefix = prefix, removed = removed, "Cleared ticket entries from Redis");
        Ok(removed)
    }
}
