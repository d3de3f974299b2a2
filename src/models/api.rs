use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FieldError;
use crate::validation::{Validate, require_non_blank, require_max_len};

/// Longest accepted `message` in an echo request.
pub const MAX_ECHO_MESSAGE_LENGTH: usize = 1024;

/// Most `tags` accepted in an echo request.
pub const MAX_ECHO_TAGS: usize = 16;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service health status
    pub status: String,
    /// Counter store backend (`memory` or `redis`)
    pub store: &'static str,
    /// Deadline-mode handlers still running
    pub inflight_handlers: usize,
    /// Seconds since startup
    pub uptime_seconds: u64,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Body of a request that passed a rate limiter.
#[derive(Debug, Serialize)]
pub struct LimitedResponse {
    pub message: String,
    /// Tenant the request was counted against, if tenant-scoped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Query parameters for the cooperative sleep endpoint.
#[derive(Debug, Deserialize)]
pub struct SlowParams {
    /// How long to sleep in milliseconds
    #[serde(default = "default_sleep_ms")]
    pub ms: u64,
}

fn default_sleep_ms() -> u64 {
    100
}

/// Result of the cooperative sleep endpoint.
#[derive(Debug, Serialize)]
pub struct SlowResponse {
    pub requested_ms: u64,
    pub slept_ms: u64,
    /// Whether the sleep was cut short by the request deadline
    pub cancelled: bool,
}

/// Payload for the validated echo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoRequest {
    pub message: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Validate for EchoRequest {
    fn validate(&self) -> Vec<FieldError> {
        let mut errors = Vec::new();

        errors.extend(require_non_blank("message", &self.message));
        errors.extend(require_max_len(
            "message",
            &self.message,
            MAX_ECHO_MESSAGE_LENGTH,
        ));

        if self.tags.len() > MAX_ECHO_TAGS {
            errors.push(FieldError::new(
                "tags",
                "too_many",
                format!("at most {MAX_ECHO_TAGS} tags are allowed"),
            ));
        }
        for (i, tag) in self.tags.iter().enumerate() {
            errors.extend(require_non_blank(&format!("tags[{i}]"), tag));
        }

        errors
    }
}

/// Echo endpoint response.
#[derive(Debug, Serialize)]
pub struct EchoResponse {
    #[serde(flatten)]
    pub request: EchoRequest,
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_params_default() {
        let params: SlowParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.ms, 100);
    }

    #[test]
    fn test_echo_request_valid() {
        let request = EchoRequest {
            message: "hello".to_string(),
            tags: vec!["a".to_string()],
        };
        assert!(request.validate().is_empty());
    }

    #[test]
    fn test_echo_request_collects_all_field_errors() {
        let request = EchoRequest {
            message: "  ".to_string(),
            tags: vec!["ok".to_string(), String::new()],
        };

        let errors = request.validate();
        let params: Vec<_> = errors.iter().map(|e| e.param.as_str()).collect();
        assert_eq!(params, vec!["message", "tags[1]"]);
    }

    #[test]
    fn test_echo_request_message_too_long() {
        let request = EchoRequest {
            message: "x".repeat(MAX_ECHO_MESSAGE_LENGTH + 1),
            tags: vec![],
        };

        let errors = request.validate();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "too_long");
    }

    #[test]
    fn test_echo_response_flattens_request() {
        let response = EchoResponse {
            request: EchoRequest {
                message: "hi".to_string(),
                tags: vec![],
            },
            received_at: Utc::now(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["message"], "hi");
        assert!(json["received_at"].is_string());
    }
}
