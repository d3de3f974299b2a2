//! Redis-backed fixed-window counters.
//!
//! Lets several application instances share one set of rate limit counters.
//!
//! ## Atomicity
//!
//! An increment is three operations: `INCR`, `PEXPIRE` only when the key was
//! just created, and `PTTL`. Issued separately (or pipelined) another client
//! can interleave between them, so all three run inside a single Lua script,
//! which Redis executes atomically.
//!
//! A key left without an expiry (for example written by an older client)
//! gets one on the next increment instead of living forever.
//!
//! ## Timeouts
//!
//! Every round trip is bounded by [`RedisStoreConfig::operation_timeout`];
//! exceeding it yields [`StoreError::Timeout`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use lifeguard::store::{RedisStore, RedisStoreConfig};
//!
//! let store = RedisStore::connect_with_config(
//!     "redis://127.0.0.1/",
//!     RedisStoreConfig { key_prefix: "api:".to_string(), ..Default::default() },
//! )
//! .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::{CounterStore, Increment, StoreError};

/// `KEYS[1]` = counter key, `ARGV[1]` = window in milliseconds.
/// Returns `{count, ttl_ms}`.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
";

/// Configuration for [`RedisStore`].
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Namespace prepended to every key (default: `"lifeguard:"`).
    pub key_prefix: String,
    /// Upper bound on a single round trip (default: 500ms).
    pub operation_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "lifeguard:".to_string(),
            operation_timeout: Duration::from_millis(500),
        }
    }
}

/// Redis [`CounterStore`].
///
/// Clones share the underlying multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Arc<Script>,
    config: RedisStoreConfig,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect with default configuration.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] if the URL is invalid or the
    /// connection cannot be established, [`StoreError::Timeout`] if that
    /// takes longer than `operation_timeout`.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection =
            bounded(config.operation_timeout, ConnectionManager::new(client)).await?;

        debug!(prefix = %config.key_prefix, "Connected Redis counter store");

        Ok(Self {
            connection,
            script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// Apply the operation timeout and flatten Redis errors.
async fn bounded<T>(
    limit: Duration,
    operation: impl Future<Output = redis::RedisResult<T>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

fn window_millis(window: Duration) -> u64 {
    // PEXPIRE rejects 0
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<Increment, StoreError> {
        self.ensure_open()?;

        let mut conn = self.connection.clone();
        let mut invocation = self.script.prepare_invoke();
        invocation.key(self.key(key)).arg(window_millis(window));

        let (count, ttl_ms): (i64, i64) =
            bounded(self.config.operation_timeout, invocation.invoke_async(&mut conn)).await?;

        let count = u64::try_from(count)
            .ok()
            .filter(|count| *count >= 1)
            .ok_or_else(|| StoreError::Backend(format!("unexpected counter value {count}").into()))?;

        Ok(Increment {
            count,
            ttl: Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0)),
        })
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let mut conn = self.connection.clone();
        let key = self.key(key);
        let count: Option<u64> = bounded(self.config.operation_timeout, conn.get(&key)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;

        let mut conn = self.connection.clone();
        let key = self.key(key);
        bounded::<()>(self.config.operation_timeout, conn.del(&key)).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Redis counter store closed");
        }
        Ok(())
    }
}
