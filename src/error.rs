//! Error types for the Scenegate middleware.

use thiserror::Error;

/// Main error type for Scenegate operations.
#[derive(Error, Debug)]
pub enum ScenegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limit backend errors (unreachable store, malformed reply)
    #[error("Rate limit backend error: {0}")]
    RateLimitBackend(String),

    /// Idempotency record store errors
    #[error("Idempotency store error: {0}")]
    IdempotencyStore(String),

    /// Shared cache errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Scenegate operations.
pub type Result<T> = std::result::Result<T, ScenegateError>;
