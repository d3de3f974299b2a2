//! # Lifeguard
//!
//! Axum middleware that keeps request handling bounded and predictable:
//!
//! - **Deadlines**: per-request budgets with cooperative cancellation, an
//!   immediate `504` on expiry, and abandonment reporting for handlers that
//!   outlive their grace period
//! - **Panic recovery**: a panicking handler becomes a `500` envelope
//! - **Exactly-once responses**: handlers and middleware write into a shared
//!   [`ResponseState`](middleware::ResponseState); the first finalization wins
//! - **Rate limiting**: fixed-window counters keyed by request dimensions,
//!   in memory or shared through Redis
//! - **SLO tracking**: latency tiers classified as `PASS`/`FAIL`
//! - **Structured errors**: one JSON envelope for every failure
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Trace → Lifecycle → Rate Limit → SLO)          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (health, limited, tenant, slow, panic, echo)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CounterStore (MemoryStore | RedisStore)                    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lifeguard::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> lifeguard::AppResult<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config).await?;
//!     let app = build_router(state.clone())?;
//!
//!     // Serve `app`, then on shutdown:
//!     state.shutdown().await
//! }
//! ```
//!
//! ## Configuration
//!
//! Limit every client to 100 requests per minute, with a 2 second budget:
//! ```bash
//! RATE_LIMIT=100 RATE_LIMIT_WINDOW_SECS=60 REQUEST_TIMEOUT_MS=2000 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod signal;
pub mod state;
pub mod store;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
