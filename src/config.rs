//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT`: Requests per window per client (default: 100, 0 disables)
//! - `RATE_LIMIT_WINDOW_SECS`: Fixed window length (default: 60)
//! - `RATE_LIMIT_HEADERS`: `always`, `on_limit_exceeded` or `never`
//! - `REDIS_URL`: Share counters through Redis instead of process memory
//!
//! # Request Lifecycle
//!
//! - `REQUEST_TIMEOUT_MS`: Handler budget (default: 30000, 0 disables timeouts)
//! - `TIMEOUT_GRACE_MS`: Grace after a timeout before a handler is abandoned (default: 5000)
//! - `SHUTDOWN_DRAIN_SECS`: How long shutdown waits for running handlers (default: 30)

use std::env;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::middleware::lifecycle::TimeoutPolicy;
use crate::middleware::rate_limit::HeaderMode;
use crate::store::RedisStoreConfig;

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests per window per client (default: 100)
    /// Set to 0 to disable rate limiting
    pub rate_limit: u64,

    /// Fixed window length (default: 60 seconds)
    pub rate_limit_window: Duration,

    /// When rate limit headers are attached (default: always)
    pub rate_limit_headers: HeaderMode,

    /// Key prefix isolating this limiter's counters (default: "global")
    pub rate_limit_name: String,

    /// Trusted proxy CIDR ranges for IP spoofing mitigation.
    /// X-Forwarded-For headers will only be trusted if the connection
    /// originates from one of these networks.
    ///
    /// Format: Comma-separated CIDR notation (e.g., "10.0.0.0/8,172.16.0.0/12")
    /// Default: Empty (trust all sources - NOT recommended for production)
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Counter Store Configuration
    // =========================================================================
    /// Redis URL; when set, counters are shared through Redis
    pub redis_url: Option<String>,

    /// Namespace prepended to every Redis key (default: "lifeguard:")
    pub redis_key_prefix: String,

    /// Upper bound on a single Redis round trip (default: 500ms)
    pub store_operation_timeout: Duration,

    /// In-memory sweeper period (default: 60 seconds)
    pub sweep_interval: Duration,

    // =========================================================================
    // Request Lifecycle Configuration
    // =========================================================================
    /// Handler budget; `None` runs handlers without a deadline (default: 30s)
    pub request_timeout: Option<Duration>,

    /// Grace period before a timed-out handler is abandoned (default: 5s)
    pub timeout_grace: Duration,

    /// Classify requests against their SLO tier (default: true)
    pub slo_enabled: bool,

    /// How long shutdown waits for in-flight handlers (default: 30s)
    pub shutdown_drain: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Emit logs as JSON lines (`LOG_FORMAT=json`, default: text)
    pub log_json: bool,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if any value fails to parse or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let request_timeout_ms: u64 = Self::parse_env("REQUEST_TIMEOUT_MS", 30_000)?;

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Rate limiting
            rate_limit: Self::parse_env("RATE_LIMIT", 100)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_headers: Self::parse_env_with("RATE_LIMIT_HEADERS", HeaderMode::Always)?,
            rate_limit_name: env::var("RATE_LIMIT_NAME").unwrap_or_else(|_| "global".to_string()),
            trusted_proxies: Self::parse_list("TRUSTED_PROXIES"),

            // Counter store
            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),
            redis_key_prefix: env::var("REDIS_KEY_PREFIX")
                .unwrap_or_else(|_| "lifeguard:".to_string()),
            store_operation_timeout: Duration::from_millis(Self::parse_env(
                "STORE_OPERATION_TIMEOUT_MS",
                500,
            )?),
            sweep_interval: Duration::from_secs(Self::parse_env("SWEEP_INTERVAL_SECS", 60)?),

            // Request lifecycle
            request_timeout: (request_timeout_ms > 0)
                .then(|| Duration::from_millis(request_timeout_ms)),
            timeout_grace: Duration::from_millis(Self::parse_env("TIMEOUT_GRACE_MS", 5000)?),
            slo_enabled: Self::parse_env("SLO_ENABLED", true)?,
            shutdown_drain: Duration::from_secs(Self::parse_env("SHUTDOWN_DRAIN_SECS", 30)?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_json: env::var("LOG_FORMAT")
                .is_ok_and(|format| format.trim().eq_ignore_ascii_case("json")),
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    fn validate(&self) -> AppResult<()> {
        if self.rate_limiting_enabled() && self.rate_limit_window.is_zero() {
            return Err(AppError::ConfigError(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(AppError::ConfigError(
                "SWEEP_INTERVAL_SECS must be greater than 0".to_string(),
            ));
        }

        if self.store_operation_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "STORE_OPERATION_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if rate limiting is enabled.
    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit > 0
    }

    /// Check if trusted proxy validation is enabled.
    pub fn proxy_validation_enabled(&self) -> bool {
        !self.trusted_proxies.is_empty()
    }

    /// Lifecycle policy for the request controller.
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            budget: self.request_timeout,
            grace: self.timeout_grace,
            slo_enabled: self.slo_enabled,
        }
    }

    pub fn redis_store_config(&self) -> RedisStoreConfig {
        RedisStoreConfig {
            key_prefix: self.redis_key_prefix.clone(),
            operation_timeout: self.store_operation_timeout,
        }
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        Self::parse_env_with(name, default)
    }

    /// Like `parse_env`, but an empty value also falls back to the default.
    fn parse_env_with<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) if !val.trim().is_empty() => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            _ => Ok(default),
        }
    }

    /// Parse a comma-separated list from an environment variable.
    fn parse_list(name: &str) -> Vec<String> {
        env::var(name)
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 3000,
            // Rate limiting
            rate_limit: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_headers: HeaderMode::Always,
            rate_limit_name: "global".to_string(),
            trusted_proxies: vec![], // Empty = trust all (dev mode)
            // Counter store
            redis_url: None,
            redis_key_prefix: "lifeguard:".to_string(),
            store_operation_timeout: Duration::from_millis(500),
            sweep_interval: Duration::from_secs(60),
            // Request lifecycle
            request_timeout: Some(Duration::from_secs(30)),
            timeout_grace: Duration::from_secs(5),
            slo_enabled: true,
            shutdown_drain: Duration::from_secs(30),
            // Observability
            log_level: "info".to_string(),
            log_json: false,
            metrics_port: 9090,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.rate_limit, 100);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 8080,
            ..Config::default()
        };

        assert_eq!(config.server_addr(), "192.168.1.1:8080");
    }

    #[test]
    fn test_rate_limiting_enabled() {
        let config = Config::default();
        assert!(config.rate_limiting_enabled());

        let config = Config {
            rate_limit: 0,
            ..Config::default()
        };
        assert!(!config.rate_limiting_enabled());
    }

    #[test]
    fn test_timeout_policy_from_config() {
        let policy = Config::default().timeout_policy();
        assert_eq!(policy.budget, Some(Duration::from_secs(30)));
        assert_eq!(policy.grace, Duration::from_secs(5));
        assert!(policy.slo_enabled);

        let config = Config {
            request_timeout: None,
            ..Config::default()
        };
        assert!(config.timeout_policy().budget.is_none());
    }

    #[test]
    fn test_metrics_addr_disabled_on_zero_port() {
        let config = Config {
            metrics_port: 0,
            ..Config::default()
        };
        assert!(config.metrics_addr().is_none());
        assert_eq!(
            Config::default().metrics_addr().unwrap().port(),
            9090
        );
    }

    #[test]
    fn test_validate_zero_window() {
        let config = Config {
            rate_limit_window: Duration::ZERO,
            ..Config::default()
        };

        let result = config.validate();
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("RATE_LIMIT_WINDOW_SECS")
        );

        // Irrelevant when limiting is off
        let config = Config {
            rate_limit: 0,
            rate_limit_window: Duration::ZERO,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_sweep_interval() {
        let config = Config {
            sweep_interval: Duration::ZERO,
            ..Config::default()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("SWEEP_INTERVAL_SECS")
        );
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }
}
