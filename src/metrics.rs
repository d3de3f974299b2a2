//! Prometheus metrics for rate limiting and request lifecycle.
//!
//! Recording functions are safe to call without an installed recorder
//! (they become no-ops), so library code records unconditionally and only
//! the binary installs the exporter.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `lifeguard_rate_limit_decisions_total` - Limiter decisions (labels: limiter, outcome)
//! - `lifeguard_timeouts_total` - Requests answered with a timeout
//! - `lifeguard_abandoned_total` - Handlers still running after timeout + grace
//! - `lifeguard_panics_total` - Recovered handler panics (label: phase)
//! - `lifeguard_slo_total` - SLO classifications (labels: tier, result)
//!
//! ## Histograms
//! - `lifeguard_request_duration_seconds` - Time from request entry to finalization (label: status)
//!
//! ## Gauges
//! - `lifeguard_inflight_handlers` - Deadline-mode handlers still running
//!
//! # Usage
//!
//! ```rust,ignore
//! use lifeguard::metrics::{init_metrics, record_timeout};
//!
//! init_metrics("0.0.0.0:9090".parse()?)?;
//! record_timeout();
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "lifeguard_rate_limit_decisions_total";
    pub const TIMEOUTS_TOTAL: &str = "lifeguard_timeouts_total";
    pub const ABANDONED_TOTAL: &str = "lifeguard_abandoned_total";
    pub const PANICS_TOTAL: &str = "lifeguard_panics_total";
    pub const SLO_TOTAL: &str = "lifeguard_slo_total";
    pub const REQUEST_DURATION_SECONDS: &str = "lifeguard_request_duration_seconds";
    pub const INFLIGHT_HANDLERS: &str = "lifeguard_inflight_handlers";
}

/// Install the Prometheus exporter and describe all metrics.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (for example the
/// listener address is in use, or a recorder is already installed).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by limiter and outcome"
    );
    describe_counter!(
        names::TIMEOUTS_TOTAL,
        "Requests answered with a timeout error"
    );
    describe_counter!(
        names::ABANDONED_TOTAL,
        "Handlers still running after their timeout and grace period"
    );
    describe_counter!(names::PANICS_TOTAL, "Recovered handler panics");
    describe_counter!(names::SLO_TOTAL, "SLO classifications by tier and result");

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Time from request entry to response finalization in seconds"
    );

    describe_gauge!(
        names::INFLIGHT_HANDLERS,
        "Deadline-mode handler tasks that have not finished"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counters
// =============================================================================

pub fn record_rate_limit_decision(limiter: &str, outcome: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "limiter" => limiter.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_timeout() {
    counter!(names::TIMEOUTS_TOTAL).increment(1);
}

pub fn record_abandoned() {
    counter!(names::ABANDONED_TOTAL).increment(1);
}

/// `phase` is `handler` for panics that shaped the response and
/// `after_timeout` for panics observed during the grace period.
pub fn record_panic(phase: &'static str) {
    counter!(names::PANICS_TOTAL, "phase" => phase).increment(1);
}

pub fn record_slo(tier: &'static str, result: &'static str) {
    counter!(names::SLO_TOTAL, "tier" => tier, "result" => result).increment(1);
}

// =============================================================================
// Histograms
// =============================================================================

pub fn record_request_duration(status: u16, elapsed: Duration) {
    histogram!(names::REQUEST_DURATION_SECONDS, "status" => status.to_string())
        .record(elapsed.as_secs_f64());
}

// =============================================================================
// Gauges
// =============================================================================

pub fn set_inflight_handlers(outstanding: usize) {
    gauge!(names::INFLIGHT_HANDLERS).set(outstanding as f64);
}
