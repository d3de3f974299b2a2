//! In-process fixed-window counters.
//!
//! All counters live in one `HashMap` behind a single reader/writer lock.
//! Increments take the write lock, so concurrent increments on one key are
//! serialized and produce contiguous counts.
//!
//! # Sweeping
//!
//! Expired entries are reset lazily on the next increment, and removed by a
//! background task every `sweep_interval` (default 60s). The sweep is
//! two-phase: expired keys are collected under the read lock, then removed
//! under the write lock after re-checking each one, so a key renewed between
//! the phases survives.
//!
//! # Closing
//!
//! [`CounterStore::close`] stops the sweeper and clears the map. Every call
//! made after that returns [`StoreError::Closed`]; closing twice is a no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::{Instant, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{CounterStore, Increment, StoreError};

/// Default period of the background sweeper.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Stand-in expiry for windows too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A counter and the end of its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub expires_at: Instant,
}

impl CounterEntry {
    fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            expires_at: window_end(now, window),
        }
    }

    /// Strictly after `expires_at`: a hit exactly at the boundary still
    /// counts against the old window.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    fn hit(&mut self, now: Instant, window: Duration) {
        if self.is_expired(now) {
            *self = Self::open(now, window);
        } else {
            self.count += 1;
        }
    }

    fn ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// `now + window`, clamped to a far-future instant instead of overflowing.
fn window_end(now: Instant, window: Duration) -> Instant {
    now.checked_add(window)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

struct Inner {
    entries: RwLock<HashMap<String, CounterEntry>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// In-memory [`CounterStore`].
///
/// Cheap to clone; clones share the same counters. Must be created inside a
/// Tokio runtime for the sweeper to run.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a store swept every [`DEFAULT_SWEEP_INTERVAL`].
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });

        spawn_sweeper(Arc::downgrade(&inner), inner.cancel.clone(), sweep_interval);

        Self { inner }
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    /// Run one sweep now and return how many entries were removed.
    pub async fn sweep_expired(&self) -> usize {
        sweep(&self.inner).await
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<Increment, StoreError> {
        self.ensure_open()?;

        let mut entries = self.inner.entries.write().await;
        // `close` may have cleared the map while this call waited for the lock
        self.ensure_open()?;
        let now = Instant::now();
        let entry = *entries
            .entry(key.to_owned())
            .and_modify(|entry| entry.hit(now, window))
            .or_insert_with(|| CounterEntry::open(now, window));

        Ok(Increment {
            count: entry.count,
            ttl: entry.ttl(now),
        })
    }

    async fn get(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let entries = self.inner.entries.read().await;
        self.ensure_open()?;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map_or(0, |entry| entry.count))
    }

    async fn reset(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;

        let mut entries = self.inner.entries.write().await;
        self.ensure_open()?;
        entries.remove(key);
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.inner.cancel.cancel();
        self.inner.entries.write().await.clear();
        debug!("Memory counter store closed");
        Ok(())
    }
}

/// Two-phase removal of expired entries.
async fn sweep(inner: &Inner) -> usize {
    let now = Instant::now();

    let expired: Vec<String> = {
        let entries = inner.entries.read().await;
        entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    };

    if expired.is_empty() {
        return 0;
    }

    let mut entries = inner.entries.write().await;
    let mut removed = 0;
    for key in expired {
        // Renewed since the read phase
        if entries.get(&key).is_some_and(|entry| entry.is_expired(now)) {
            entries.remove(&key);
            removed += 1;
        }
    }
    removed
}

fn spawn_sweeper(inner: Weak<Inner>, cancel: CancellationToken, sweep_interval: Duration) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("No Tokio runtime available, expired counters will only be reset lazily");
        return;
    };

    handle.spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else { break };
                    let removed = sweep(&inner).await;
                    if removed > 0 {
                        trace!(removed, "Swept expired rate limit counters");
                    }
                }
            }
        }

        debug!("Counter sweeper shutting down");
    });
}
