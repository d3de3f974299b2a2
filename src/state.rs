//! Shared application state for Axum handlers.
//!
//! Holds the counter store shared by every limiter, the handler-level tenant
//! limiter, and the in-flight tracker the lifecycle layer counts against.
//!
//! # Shutdown
//!
//! [`AppState::shutdown`] drains in-flight deadline-mode handlers (bounded
//! by `SHUTDOWN_DRAIN_SECS`) and then closes the counter store. The store
//! is closed even if the drain deadline passes.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::AppResult;
use crate::middleware::ip::TrustedProxyConfig;
use crate::middleware::lifecycle::InFlightTracker;
use crate::middleware::rate_limit::{Dimension, RateLimiter};
use crate::store::{CounterStore, MemoryStore, RedisStore};

/// Shared application state for Axum handlers.
///
/// Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Counter store shared by all limiters
    pub store: Arc<dyn CounterStore>,
    /// `memory` or `redis`
    pub store_backend: &'static str,
    /// Client address resolution shared by the `ip` dimensions
    pub trusted_proxies: TrustedProxyConfig,
    /// Handler-level limiter keyed by tenant and endpoint (`None` if disabled)
    pub tenant_limiter: Option<Arc<RateLimiter>>,
    /// Deadline-mode handlers still running
    pub tracker: InFlightTracker,
    /// Timestamp when the application started
    pub started_at: Instant,
}

impl AppState {
    /// Build state from configuration, connecting to Redis if configured.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if Redis is configured but unreachable, or
    /// `AppError::RateLimit` if the limiter configuration is invalid.
    pub async fn new(config: Config) -> AppResult<Self> {
        let (store, store_backend): (Arc<dyn CounterStore>, _) = match &config.redis_url {
            Some(url) => {
                let store = RedisStore::connect_with_config(url, config.redis_store_config()).await?;
                info!(prefix = %config.redis_key_prefix, "Using Redis counter store");
                let store: Arc<dyn CounterStore> = Arc::new(store);
                (store, "redis")
            }
            None => {
                info!(
                    sweep_interval_secs = config.sweep_interval.as_secs(),
                    "Using in-memory counter store"
                );
                let store: Arc<dyn CounterStore> =
                    Arc::new(MemoryStore::with_sweep_interval(config.sweep_interval));
                (store, "memory")
            }
        };

        Self::with_store(config, store, store_backend, InFlightTracker::global().clone())
    }

    /// Build state around an existing store and tracker.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RateLimit` if the limiter configuration is invalid.
    pub fn with_store(
        config: Config,
        store: Arc<dyn CounterStore>,
        store_backend: &'static str,
        tracker: InFlightTracker,
    ) -> AppResult<Self> {
        let trusted_proxies = TrustedProxyConfig::new(&config.trusted_proxies);

        let tenant_limiter = if config.rate_limiting_enabled() {
            let limiter = RateLimiter::new(
                store.clone(),
                config.rate_limit,
                config.rate_limit_window,
                vec![
                    Dimension::required_header("x-tenant-id"),
                    Dimension::endpoint(),
                ],
            )?
            .with_name("tenant")
            .with_header_mode(config.rate_limit_headers);
            Some(Arc::new(limiter))
        } else {
            None
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            store_backend,
            trusted_proxies,
            tenant_limiter,
            tracker,
            started_at: Instant::now(),
        })
    }

    /// The per-client limiter wrapped around rate limited routes.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RateLimit` if the limiter configuration is invalid.
    pub fn client_limiter(&self) -> AppResult<Option<RateLimiter>> {
        if !self.config.rate_limiting_enabled() {
            return Ok(None);
        }

        let limiter = RateLimiter::new(
            self.store.clone(),
            self.config.rate_limit,
            self.config.rate_limit_window,
            vec![Dimension::client_ip(self.trusted_proxies.clone())],
        )?
        .with_name(self.config.rate_limit_name.clone())
        .with_header_mode(self.config.rate_limit_headers);

        Ok(Some(limiter))
    }

    /// Drain in-flight handlers, then close the counter store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Drain` if handlers were still running at the
    /// deadline, or `AppError::Store` if closing the store failed.
    pub async fn shutdown(&self) -> AppResult<()> {
        let drain_timeout = self.config.shutdown_drain;
        info!(
            outstanding = self.tracker.outstanding(),
            drain_timeout_secs = drain_timeout.as_secs(),
            "Draining in-flight handlers"
        );

        let drained = self.tracker.drain(drain_timeout).await;
        if let Err(e) = &drained {
            warn!(error = %e, "Shutdown drain incomplete");
        }

        self.store.close().await?;
        info!("Counter store closed");

        drained?;
        Ok(())
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::AppError;
    use crate::store::StoreError;

    fn memory_state(config: Config) -> AppState {
        AppState::with_store(
            config,
            Arc::new(MemoryStore::new()),
            "memory",
            InFlightTracker::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_limiters_follow_config() {
        let state = memory_state(Config::default());
        assert!(state.tenant_limiter.is_some());
        assert_eq!(state.client_limiter().unwrap().unwrap().name(), Some("global"));

        let state = memory_state(Config {
            rate_limit: 0,
            ..Config::default()
        });
        assert!(state.tenant_limiter.is_none());
        assert!(state.client_limiter().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_store() {
        let state = memory_state(Config::default());
        state.shutdown().await.unwrap();

        assert!(matches!(
            state.store.increment("k", Duration::from_secs(1)).await,
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_reports_incomplete_drain_but_closes_store() {
        let state = memory_state(Config {
            shutdown_drain: Duration::from_millis(50),
            ..Config::default()
        });
        let _running = state.tracker.enter();

        let err = state.shutdown().await.unwrap_err();
        assert!(matches!(err, AppError::Drain(_)));
        assert!(matches!(state.store.get("k").await, Err(StoreError::Closed)));
    }
}
