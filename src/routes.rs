//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │    Lifecycle     │ ← 504 on deadline, 500 on panic, X-SLO-Result
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │  Route layers    │ ← per-client rate limit (/limited), SLO tier
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Handler
//! ```
//!
//! # Routes
//!
//! - `GET /health` - Liveness (no limit, no SLO)
//! - `GET /limited` - Limited per client address
//! - `GET /tenant` - Limited per tenant and endpoint inside the handler
//! - `GET /slow?ms=N` - Cooperative sleep, `high` SLO tier
//! - `GET /panic` - Panic recovery
//! - `POST /echo` - Validated echo, `critical` SLO tier

use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::AppResult;
use crate::handlers;
use crate::middleware::{LifecycleLayer, RateLimitLayer, SloLayer, SloTier};
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// # Middleware Configuration
///
/// - **Rate Limiting**: Enabled if `RATE_LIMIT > 0`
/// - **Deadlines**: Enabled if `REQUEST_TIMEOUT_MS > 0`; otherwise handlers
///   run inline and only panics are recovered
/// - **SLO header**: Controlled by `SLO_ENABLED`
///
/// # Errors
///
/// Returns `AppError::RateLimit` if rate limiting configuration is invalid.
pub fn build_router(state: AppState) -> AppResult<Router> {
    let config = &state.config;

    let mut limited = get(handlers::limited);
    match state.client_limiter()? {
        Some(limiter) => {
            info!(
                limit = limiter.limit(),
                window_secs = limiter.window().as_secs(),
                name = limiter.name().unwrap_or(""),
                trusted_proxies = config.trusted_proxies.len(),
                "Rate limiting enabled"
            );
            limited = limited.layer(RateLimitLayer::new(limiter));
        }
        None => info!("Rate limiting disabled (RATE_LIMIT=0)"),
    }

    let policy = config.timeout_policy();
    match policy.budget {
        Some(budget) => info!(
            budget_ms = budget.as_millis(),
            grace_ms = policy.grace.as_millis(),
            "Request deadlines enabled"
        ),
        None => info!("Request deadlines disabled (REQUEST_TIMEOUT_MS=0)"),
    }

    let lifecycle = LifecycleLayer::new(policy)
        .with_tracker(state.tracker.clone())
        .on_abandon(|abandoned| {
            warn!(
                method = %abandoned.method,
                path = %abandoned.path,
                elapsed_ms = abandoned.elapsed.as_millis(),
                "Abandoned handler is still holding resources"
            );
        });

    let router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/limited", limited)
        .route("/tenant", get(handlers::tenant))
        .route(
            "/slow",
            get(handlers::slow).layer(SloLayer::new(SloTier::High)),
        )
        .route("/panic", get(handlers::panic))
        .route(
            "/echo",
            post(handlers::echo).layer(SloLayer::new(SloTier::Critical)),
        )
        // Applied bottom to top: the last layer is the outermost
        .layer(lifecycle)
        .layer(TraceLayer::new_for_http());

    Ok(router.with_state(state))
}
