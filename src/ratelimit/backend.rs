//! Rate limit store trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use serde::Serialize;

use super::counter::RateLimitConfig;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests left in the current window after this one
    pub remaining: u64,
    /// Seconds the client should wait before retrying (0 when allowed)
    pub retry_after_secs: u64,
}

impl RateLimitDecision {
    /// An accepted request with `remaining` quota left.
    pub fn allow(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_secs: 0,
        }
    }

    /// A rejected request that may retry after `retry_after_secs`.
    pub fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after_secs,
        }
    }
}

/// Trait for rate limit store implementations.
///
/// This trait abstracts over the in-process fixed-window store and the
/// distributed sliding-window store so the middleware works with either.
/// Implementations must be safe under unbounded concurrent calls for the same
/// or different keys.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key` against `config` and decide whether it may proceed.
    async fn allow(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision;

    /// Requests allowed only because the store could not be reached.
    fn fail_open_count(&self) -> u64 {
        0
    }
}
