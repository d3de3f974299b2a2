//! Per-request response state with a one-way write latch.
//!
//! A [`ResponseState`] is created by the lifecycle layer for every request
//! and shared (by cheap clone) between the handler, any helper tasks it
//! spawns, and the controller that eventually writes the response.
//!
//! ## Latch
//!
//! The controller's completion path and its timeout path race to finalize.
//! Whichever wins the compare-and-swap on `written` builds the response;
//! the loser gets `None`. Setters check the latch under the lock, so once
//! it is closed every mutation is silently discarded.
//!
//! Concurrent setters from within one request are not ordered: the last
//! write before the latch closes is what gets serialized.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::Json;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::warn;

use crate::error::ApiError;

#[derive(Debug, Default)]
struct Slots {
    error: Option<ApiError>,
    status: Option<StatusCode>,
    body: Option<serde_json::Value>,
    headers: HeaderMap,
}

#[derive(Debug, Default)]
struct Shared {
    slots: Mutex<Slots>,
    written: AtomicBool,
}

/// Mutable response for one request, finalized exactly once.
#[derive(Debug, Clone, Default)]
pub struct ResponseState {
    shared: Arc<Shared>,
}

impl ResponseState {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        // A panicking setter cannot leave Slots half-updated
        self.shared
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the slots unless the latch is closed.
    fn mutate(&self, f: impl FnOnce(&mut Slots)) {
        let mut slots = self.slots();
        if self.shared.written.load(Ordering::Acquire) {
            return;
        }
        f(&mut slots);
    }

    /// Record an error; it takes precedence over any body at finalization.
    pub fn set_error(&self, error: ApiError) {
        self.mutate(|slots| slots.error = Some(error));
    }

    /// Set a JSON body with the given status.
    ///
    /// A body that fails to serialize is recorded as an internal error.
    pub fn set_json<T: Serialize>(&self, status: StatusCode, body: &T) {
        match serde_json::to_value(body) {
            Ok(value) => self.mutate(|slots| {
                slots.status = Some(status);
                slots.body = Some(value);
            }),
            Err(e) => {
                warn!(error = %e, "Failed to serialize response body");
                self.set_error(ApiError::INTERNAL);
            }
        }
    }

    /// Override the status of the body or of the inner response.
    pub fn set_status(&self, status: StatusCode) {
        self.mutate(|slots| slots.status = Some(status));
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        self.mutate(|slots| {
            slots.headers.insert(name, value);
        });
    }

    pub fn extend_headers(&self, headers: HeaderMap) {
        if headers.is_empty() {
            return;
        }
        self.mutate(|slots| slots.headers.extend(headers));
    }

    pub fn error(&self) -> Option<ApiError> {
        self.slots().error.clone()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.slots().status
    }

    pub fn body(&self) -> Option<serde_json::Value> {
        self.slots().body.clone()
    }

    pub fn headers(&self) -> HeaderMap {
        self.slots().headers.clone()
    }

    /// Whether the response has already been finalized.
    pub fn is_written(&self) -> bool {
        self.shared.written.load(Ordering::Acquire)
    }

    fn claim(&self) -> bool {
        self.shared
            .written
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the latch and build the response.
    ///
    /// Precedence: recorded error, then recorded body, then `fallback`
    /// (the inner service's response). Accumulated headers are merged onto
    /// the winner. Returns `None` if the state was already finalized.
    pub fn finalize(&self, fallback: Response) -> Option<Response> {
        if !self.claim() {
            return None;
        }

        let mut slots = self.slots();
        let mut response = match (slots.error.take(), slots.body.take()) {
            (Some(error), _) => error.into_response(),
            (None, Some(body)) => {
                (slots.status.unwrap_or(StatusCode::OK), Json(body)).into_response()
            }
            (None, None) => {
                let mut response = fallback;
                if let Some(status) = slots.status {
                    *response.status_mut() = status;
                }
                response
            }
        };
        response
            .headers_mut()
            .extend(std::mem::take(&mut slots.headers));

        Some(response)
    }

    /// Claim the latch and respond with `error`, whatever the state holds.
    ///
    /// The latch is claimed before the error is recorded, so a concurrent
    /// handler write can never replace it.
    pub fn finalize_error(&self, error: ApiError) -> Option<Response> {
        if !self.claim() {
            return None;
        }

        let mut slots = self.slots();
        let mut response = error.into_response();
        response
            .headers_mut()
            .extend(std::mem::take(&mut slots.headers));

        Some(response)
    }
}

impl<S> FromRequestParts<S> for ResponseState
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts.extensions.get::<ResponseState>().cloned().ok_or_else(|| {
            warn!("ResponseState extractor used on a route without LifecycleLayer");
            ApiError::INTERNAL
        })
    }
}

/// Handler return type that defers entirely to the [`ResponseState`].
///
/// The lifecycle layer replaces this empty response with whatever the state
/// holds at finalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deferred;

impl IntoResponse for Deferred {
    fn into_response(self) -> Response {
        StatusCode::NO_CONTENT.into_response()
    }
}
