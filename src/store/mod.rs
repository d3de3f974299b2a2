//! Fixed-window counter storage.
//!
//! The rate limiter only ever talks to a [`CounterStore`]. Two backends ship
//! with the crate:
//!
//! - [`MemoryStore`]: a single-process map behind one reader/writer lock,
//!   swept by a background task.
//! - [`RedisStore`]: a shared backend where increment, first-write expiry
//!   and TTL lookup run as one atomic Lua script.
//!
//! # Contract
//!
//! `increment` is atomic per key: N concurrent increments on an absent key
//! yield the counts `1..=N`, each exactly once. A counter is never observed
//! below 1, and an increment after the window has expired starts a new
//! window at 1.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{CounterEntry, MemoryStore};
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Errors surfaced by counter backends.
///
/// None of these mean "not limited": the rate limiter maps every variant to
/// an internal error.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("counter store is closed")]
    Closed,

    #[error("counter store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("counter store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(Box::new(e))
    }
}

/// Result of a single increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Increment {
    /// Count within the current window, including this increment.
    pub count: u64,
    /// Time left until the window resets.
    pub ttl: Duration,
}

/// Pluggable atomic counter backend.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, opening a new window of length `window` if the key
    /// is absent or expired.
    async fn increment(&self, key: &str, window: Duration) -> Result<Increment, StoreError>;

    /// Current count for `key`, or 0 if absent or expired.
    async fn get(&self, key: &str) -> Result<u64, StoreError>;

    /// Drop the counter for `key`.
    async fn reset(&self, key: &str) -> Result<(), StoreError>;

    /// Release background resources. Subsequent calls return
    /// [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}
