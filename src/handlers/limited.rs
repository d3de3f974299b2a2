//! Rate limited demonstration endpoints.
//!
//! # Endpoints
//!
//! - `GET /limited` - Limited per client address by `RateLimitLayer`
//! - `GET /tenant` - Limited per `X-Tenant-Id` and endpoint inside the handler
//!
//! `/tenant` shows handler-level limiting: the limiter writes its headers and
//! any rejection into the request's [`ResponseState`], and the handler only
//! sets a body when the limiter lets it proceed.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::request::Parts;
use tracing::{debug, instrument};

use crate::middleware::rate_limit::RequestView;
use crate::middleware::response::{Deferred, ResponseState};
use crate::models::LimitedResponse;
use crate::state::AppState;

/// Counted by the client-address limiter wrapped around this route.
#[instrument]
pub async fn limited() -> Json<LimitedResponse> {
    Json(LimitedResponse {
        message: "request allowed".to_string(),
        tenant: None,
    })
}

/// Counted per tenant; a missing `X-Tenant-Id` is a 400 naming the header.
#[instrument(skip_all)]
pub async fn tenant(
    State(state): State<AppState>,
    response: ResponseState,
    parts: Parts,
) -> Deferred {
    let view = RequestView::from(&parts);

    if let Some(limiter) = &state.tenant_limiter
        && !limiter.apply(&view, &response).await
    {
        debug!("Tenant request rejected");
        return Deferred;
    }

    let tenant = view
        .headers
        .get("x-tenant-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string());

    response.set_json(
        StatusCode::OK,
        &LimitedResponse {
            message: "tenant request allowed".to_string(),
            tenant,
        },
    );
    Deferred
}
