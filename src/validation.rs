//! Payload validation contract.
//!
//! The core only sees "validate(payload) → field errors". Payload types
//! implement [`Validate`]; [`validate_payload`] turns a non-empty error list
//! into [`ApiError::VALIDATION_FAILED`] carrying every field error in order.

use crate::error::{ApiError, FieldError};

/// A payload that can report its own field-level problems.
pub trait Validate {
    /// All problems found, in field order. Empty means valid.
    fn validate(&self) -> Vec<FieldError>;
}

/// Validate `payload`, producing a 400 with the full field list on failure.
///
/// # Errors
///
/// [`ApiError::VALIDATION_FAILED`] with `errors` set when any field fails.
pub fn validate_payload<T: Validate + ?Sized>(payload: &T) -> Result<(), ApiError> {
    let errors = payload.validate();
    if errors.is_empty() {
        return Ok(());
    }
    Err(ApiError::VALIDATION_FAILED.with_field_errors(errors))
}

// =============================================================================
// Field Checks
// =============================================================================

/// `value` must contain something other than whitespace.
pub fn require_non_blank(param: &str, value: &str) -> Option<FieldError> {
    value
        .trim()
        .is_empty()
        .then(|| FieldError::new(param, "required", format!("{param} is required")))
}

/// `value` must be at most `max` characters.
pub fn require_max_len(param: &str, value: &str, max: usize) -> Option<FieldError> {
    (value.chars().count() > max).then(|| {
        FieldError::new(
            param,
            "too_long",
            format!("{param} cannot exceed {max} characters"),
        )
    })
}
