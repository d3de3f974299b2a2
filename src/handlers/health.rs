//! Health endpoint.
//!
//! # Endpoints
//!
//! - `GET /health` - Liveness with counter store backend and in-flight handler count

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK. Not rate limited and not tracked against an SLO.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "store": "memory",
///   "inflight_handlers": 0,
///   "uptime_seconds": 42,
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        store: state.store_backend,
        inflight_handlers: state.tracker.outstanding(),
        uptime_seconds: state.uptime_seconds(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}
