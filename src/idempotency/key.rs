//! Idempotency key extraction and validation.

use axum::http::HeaderMap;
use thiserror::Error;

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Longest key accepted unless configured otherwise.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 64;

/// Why an idempotency key was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyKeyError {
    #[error("Idempotency-Key header is required for this operation")]
    Missing,

    #[error("Idempotency-Key must be at most {max} characters")]
    TooLong { max: usize },

    #[error("Idempotency-Key may only contain letters, digits, '-', '_', ':' and '.'")]
    Invalid,
}

impl IdempotencyKeyError {
    /// Machine-readable code returned to the client.
    pub fn code(&self) -> &'static str {
        match self {
            IdempotencyKeyError::Missing => "missing_idempotency_key",
            IdempotencyKeyError::TooLong { .. } => "idempotency_key_too_long",
            IdempotencyKeyError::Invalid => "invalid_idempotency_key",
        }
    }
}

/// Extract and validate the idempotency key of a request.
pub fn extract_key(headers: &HeaderMap, max_len: usize) -> Result<String, IdempotencyKeyError> {
    let value = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => value.to_str().map_err(|_| IdempotencyKeyError::Invalid)?,
        None => return Err(IdempotencyKeyError::Missing),
    };
    validate_key(value.trim(), max_len).map(str::to_string)
}

/// Validate a raw key.
pub fn validate_key(key: &str, max_len: usize) -> Result<&str, IdempotencyKeyError> {
    if key.is_empty() {
        return Err(IdempotencyKeyError::Missing);
    }
    if key.chars().count() > max_len {
        return Err(IdempotencyKeyError::TooLong { max: max_len });
    }
    if !key.chars().all(is_key_char) {
        return Err(IdempotencyKeyError::Invalid);
    }
    Ok(key)
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}
