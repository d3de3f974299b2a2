//! HTTP middleware for request lifecycles, rate limiting and SLO tracking.
//!
//! - **Lifecycle**: deadline enforcement, panic recovery, abandonment and drain
//! - **Response state**: exactly-once response finalization shared by
//!   handlers and the lifecycle controller
//! - **Rate Limiting**: fixed-window counters keyed by request dimensions
//! - **SLO**: latency tier attachment and PASS/FAIL classification
//! - **Client IP**: trusted proxy aware address resolution
//!
//! # Architecture
//!
//! ```text
//! Request → Trace → Lifecycle → [Rate Limit] → [SLO] → Handler
//!                      ↓             ↓
//!               504 / 500 /     429 / 400 / 500
//!               X-SLO-Result    RateLimit-* headers
//! ```
//!
//! The lifecycle layer must wrap everything that writes into
//! [`ResponseState`](response::ResponseState): it installs the state and
//! turns it into the final response.

pub mod ip;
pub mod lifecycle;
pub mod rate_limit;
pub mod response;
pub mod slo;

pub use ip::{CidrRange, TrustedProxyConfig, client_ip};
pub use lifecycle::{
    Abandoned, DrainError, InFlightTracker, LifecycleLayer, RequestDeadline, TimeoutPolicy,
};
pub use rate_limit::{
    Decision, Dimension, HeaderMode, LimitRejection, Quota, RateLimitError, RateLimitLayer,
    RateLimiter, RequestView,
};
pub use response::{Deferred, ResponseState};
pub use slo::{SloConfig, SloLayer, SloOutcome, SloTier, SloTracker};
