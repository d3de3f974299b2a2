//! Structured errors and the JSON error envelope.
//!
//! Every client-visible failure is an [`ApiError`]. The HTTP status travels
//! with the error value and is never read back from the body:
//!
//! ```json
//! {
//!   "error": {
//!     "type": "invalid_request_error",
//!     "code": "validation_failed",
//!     "message": "Request validation failed",
//!     "errors": [{"param": "name", "code": "required", "message": "name is required"}]
//!   }
//! }
//! ```
//!
//! # Sentinels
//!
//! The associated constants (`ApiError::TIMEOUT`, `ApiError::RATE_LIMITED`, ...)
//! are the shared catalogue. Per-request customisation goes through the
//! copy-on-write builders (`with_message`, `with_param`, `with_field_errors`),
//! which return a new value and leave the sentinel untouched.
//!
//! Process-level failures (configuration, store setup, drain) use [`AppError`].

use std::borrow::Cow;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::middleware::lifecycle::DrainError;
use crate::middleware::rate_limit::RateLimitError;
use crate::store::StoreError;

/// A single field-level failure inside a validation error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub param: String,
    pub code: String,
    pub message: String,
}

impl FieldError {
    pub fn new(
        param: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            param: param.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Structured, client-facing error.
///
/// `kind` is serialized as `"type"`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct ApiError {
    pub kind: Cow<'static, str>,
    pub code: Cow<'static, str>,
    pub message: Cow<'static, str>,
    pub param: Option<Cow<'static, str>>,
    pub field_errors: Vec<FieldError>,
    pub status: StatusCode,
}

const INVALID_REQUEST_TYPE: &str = "invalid_request_error";
const RATE_LIMIT_TYPE: &str = "rate_limit_error";
const API_ERROR_TYPE: &str = "api_error";

impl ApiError {
    pub const INVALID_REQUEST: ApiError = ApiError::sentinel(
        INVALID_REQUEST_TYPE,
        "invalid_request",
        "The request could not be processed",
        StatusCode::BAD_REQUEST,
    );

    pub const VALIDATION_FAILED: ApiError = ApiError::sentinel(
        INVALID_REQUEST_TYPE,
        "validation_failed",
        "Request validation failed",
        StatusCode::BAD_REQUEST,
    );

    pub const MISSING_DIMENSION: ApiError = ApiError::sentinel(
        INVALID_REQUEST_TYPE,
        "missing_rate_limit_key",
        "A value required for rate limiting is missing",
        StatusCode::BAD_REQUEST,
    );

    pub const NOT_FOUND: ApiError = ApiError::sentinel(
        INVALID_REQUEST_TYPE,
        "not_found",
        "Resource not found",
        StatusCode::NOT_FOUND,
    );

    pub const RATE_LIMITED: ApiError = ApiError::sentinel(
        RATE_LIMIT_TYPE,
        "rate_limit_exceeded",
        "Rate limit exceeded. Please retry later.",
        StatusCode::TOO_MANY_REQUESTS,
    );

    pub const INTERNAL: ApiError = ApiError::sentinel(
        API_ERROR_TYPE,
        "internal_error",
        "An internal error occurred. Please contact support if the issue persists.",
        StatusCode::INTERNAL_SERVER_ERROR,
    );

    pub const SERVICE_UNAVAILABLE: ApiError = ApiError::sentinel(
        API_ERROR_TYPE,
        "service_unavailable",
        "Service is temporarily unavailable. Please try again later.",
        StatusCode::SERVICE_UNAVAILABLE,
    );

    pub const TIMEOUT: ApiError = ApiError::sentinel(
        API_ERROR_TYPE,
        "request_timeout",
        "The request did not complete in time. Please try again.",
        StatusCode::GATEWAY_TIMEOUT,
    );

    const fn sentinel(
        kind: &'static str,
        code: &'static str,
        message: &'static str,
        status: StatusCode,
    ) -> Self {
        Self {
            kind: Cow::Borrowed(kind),
            code: Cow::Borrowed(code),
            message: Cow::Borrowed(message),
            param: None,
            field_errors: Vec::new(),
            status,
        }
    }

    /// Build a one-off error outside the catalogue.
    pub fn new(
        kind: impl Into<Cow<'static, str>>,
        code: impl Into<Cow<'static, str>>,
        message: impl Into<Cow<'static, str>>,
        status: StatusCode,
    ) -> Self {
        Self {
            kind: kind.into(),
            code: code.into(),
            message: message.into(),
            param: None,
            field_errors: Vec::new(),
            status,
        }
    }

    pub fn with_message(&self, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            message: message.into(),
            ..self.clone()
        }
    }

    pub fn with_param(&self, param: impl Into<Cow<'static, str>>) -> Self {
        Self {
            param: Some(param.into()),
            ..self.clone()
        }
    }

    pub fn with_field_errors(&self, field_errors: Vec<FieldError>) -> Self {
        Self {
            field_errors,
            ..self.clone()
        }
    }

    /// True when `self` was derived from `sentinel` (same type and code).
    pub fn is(&self, sentinel: &ApiError) -> bool {
        self.kind == sentinel.kind && self.code == sentinel.code
    }

    /// Serialize the JSON envelope without the status.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(Envelope::from(self)).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    error: EnvelopeBody<'a>,
}

#[derive(Serialize)]
struct EnvelopeBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    code: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    param: Option<&'a str>,
    #[serde(skip_serializing_if = "<[FieldError]>::is_empty")]
    errors: &'a [FieldError],
}

impl<'a> From<&'a ApiError> for Envelope<'a> {
    fn from(err: &'a ApiError) -> Self {
        Self {
            error: EnvelopeBody {
                kind: &err.kind,
                code: &err.code,
                message: &err.message,
                param: err.param.as_deref(),
                errors: &err.field_errors,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = %self.code, status = %self.status, "Request failed");
        } else {
            tracing::debug!(code = %self.code, status = %self.status, "Request rejected");
        }

        (self.status, Json(Envelope::from(&self))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    /// Map body-binding failures without leaking internal type names.
    fn from(rejection: JsonRejection) -> Self {
        let message = match rejection {
            JsonRejection::JsonDataError(_) => "Invalid data type in request body",
            JsonRejection::JsonSyntaxError(_) => "Malformed JSON in request body",
            JsonRejection::MissingJsonContentType(_) => {
                "Expected request with `Content-Type: application/json`"
            }
            _ => "Invalid request format",
        };
        ApiError::INVALID_REQUEST.with_message(message)
    }
}

/// Process-level errors: configuration, backend setup and shutdown.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    #[error("Rate limiter configuration error: {0}")]
    RateLimit(#[from] RateLimitError),

    #[error(transparent)]
    Drain(#[from] DrainError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
