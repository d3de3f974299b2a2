//! Validated echo endpoint.
//!
//! # Endpoints
//!
//! - `POST /echo` - Returns the payload if it passes validation
//!
//! Malformed JSON becomes `invalid_request`; a well-formed payload with bad
//! fields becomes `validation_failed` listing every field error.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use chrono::Utc;
use tracing::instrument;

use crate::error::ApiError;
use crate::models::{EchoRequest, EchoResponse};
use crate::validation::validate_payload;

#[instrument(skip_all)]
pub async fn echo(
    payload: Result<Json<EchoRequest>, JsonRejection>,
) -> Result<Json<EchoResponse>, ApiError> {
    let Json(request) = payload?;
    validate_payload(&request)?;

    Ok(Json(EchoResponse {
        request,
        received_at: Utc::now(),
    }))
}
