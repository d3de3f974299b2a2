//! Lifecycle demonstration endpoints.
//!
//! # Endpoints
//!
//! - `GET /slow?ms=N` - Sleeps `N` ms, stopping early when the deadline fires
//! - `GET /panic` - Panics; the lifecycle layer answers with a 500

use std::time::Duration;

use axum::Json;
use axum::extract::Query;
use tokio::time::{Instant, sleep};
use tracing::{info, instrument};

use crate::middleware::lifecycle::RequestDeadline;
use crate::models::{SlowParams, SlowResponse};

/// Cooperative sleep.
///
/// Past the request deadline the body below is discarded: the client has
/// already received the timeout error.
#[instrument(skip(deadline))]
pub async fn slow(
    deadline: Option<RequestDeadline>,
    Query(params): Query<SlowParams>,
) -> Json<SlowResponse> {
    let started = Instant::now();
    let nap = sleep(Duration::from_millis(params.ms));

    let cancelled = match &deadline {
        Some(deadline) => {
            tokio::select! {
                () = nap => false,
                () = deadline.cancelled() => true,
            }
        }
        None => {
            nap.await;
            false
        }
    };

    let slept_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if cancelled {
        info!(requested_ms = params.ms, slept_ms, "Sleep cut short by deadline");
    }

    Json(SlowResponse {
        requested_ms: params.ms,
        slept_ms,
        cancelled,
    })
}

/// Always panics.
#[instrument]
pub async fn panic() -> &'static str {
    panic!("panic endpoint called");
}
