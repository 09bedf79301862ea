//! Distributed sliding-window rate limit store.
//!
//! The sliding window is evaluated by a backend that runs
//! "expire, count, conditionally insert" as one atomic unit against a shared
//! ordered set (see [`RedisSlidingWindow`](super::RedisSlidingWindow)).
//! This store owns the policy around that call: it bounds it with a short
//! deadline and fails open whenever the backend is slow, unreachable, or
//! returns something it cannot interpret.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

use super::backend::{RateLimitDecision, RateLimitStore};
use super::counter::RateLimitConfig;
use crate::error::{Result, ScenegateError};

/// Default deadline for one backend round trip.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_millis(50);
/// Default extra lifetime given to a key beyond its window.
pub const DEFAULT_EXPIRY_BUFFER: Duration = Duration::from_secs(1);

/// Arguments for one atomic sliding-window evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlidingWindowRequest {
    /// Rate limit key
    pub key: String,
    /// Current time in milliseconds since the Unix epoch
    pub now_ms: i64,
    /// Window length in milliseconds
    pub window_ms: i64,
    /// Maximum entries allowed inside the window
    pub limit: i64,
    /// Expiry to set on the key after an insert, in milliseconds
    pub ttl_ms: i64,
}

impl SlidingWindowRequest {
    fn new(key: &str, config: &RateLimitConfig, now_ms: i64, expiry_buffer: Duration) -> Self {
        let window_ms = duration_ms(config.window());
        Self {
            key: key.to_string(),
            now_ms,
            window_ms,
            limit: i64::try_from(config.limit()).unwrap_or(i64::MAX),
            ttl_ms: window_ms.saturating_add(duration_ms(expiry_buffer)),
        }
    }
}

/// A backend able to run the sliding-window step atomically.
///
/// The reply is the raw `[allowed, remaining, retry_after_ms]` triple;
/// validation is left to the store so every backend is held to the same
/// shape checks.
#[async_trait]
pub trait SlidingWindowBackend: Send + Sync {
    /// Run one atomic expire/count/insert step.
    async fn execute(&self, request: &SlidingWindowRequest) -> Result<Vec<i64>>;
}

/// A validated backend reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlidingWindowReply {
    allowed: bool,
    remaining: u64,
    retry_after_ms: u64,
}

impl SlidingWindowReply {
    fn parse(raw: &[i64], limit: u64) -> Result<Self> {
        let [allowed, remaining, retry_after_ms] = raw else {
            return Err(malformed(format!("expected 3 elements, got {}", raw.len())));
        };

        let allowed = match allowed {
            0 => false,
            1 => true,
            other => return Err(malformed(format!("allowed flag {}", other))),
        };
        let remaining = u64::try_from(*remaining)
            .ok()
            .filter(|r| *r < limit.max(1))
            .ok_or_else(|| malformed(format!("remaining {}", remaining)))?;
        let retry_after_ms = u64::try_from(*retry_after_ms)
            .map_err(|_| malformed(format!("retry_after_ms {}", retry_after_ms)))?;

        Ok(Self {
            allowed,
            remaining,
            retry_after_ms,
        })
    }

    fn into_decision(self) -> RateLimitDecision {
        if self.allowed {
            RateLimitDecision::allow(self.remaining)
        } else {
            RateLimitDecision::deny(self.retry_after_ms.div_ceil(1000).max(1))
        }
    }
}

fn malformed(detail: String) -> ScenegateError {
    ScenegateError::RateLimitBackend(format!("malformed sliding window reply: {}", detail))
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_ms)
        .unwrap_or_default()
}

/// A sliding-window rate limit store backed by a shared cache.
///
/// Availability of the protected service must not depend on the cache, so
/// every failure is answered with a full-quota allow and counted.
pub struct SlidingWindowStore<B> {
    /// Atomic sliding-window executor
    backend: B,
    /// Deadline for one backend call
    timeout: Duration,
    /// Extra key lifetime past the window
    expiry_buffer: Duration,
    /// Number of fail-open decisions made
    fail_open_count: AtomicU64,
}

impl<B: SlidingWindowBackend> SlidingWindowStore<B> {
    /// Create a store with the default deadline and expiry buffer.
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            timeout: DEFAULT_BACKEND_TIMEOUT,
            expiry_buffer: DEFAULT_EXPIRY_BUFFER,
            fail_open_count: AtomicU64::new(0),
        }
    }

    /// Set the deadline for one backend call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the extra lifetime given to keys beyond their window.
    pub fn with_expiry_buffer(mut self, expiry_buffer: Duration) -> Self {
        self.expiry_buffer = expiry_buffer;
        self
    }

    /// Number of requests allowed because the backend failed.
    pub fn fail_open_count(&self) -> u64 {
        self.fail_open_count.load(Ordering::Relaxed)
    }

    /// Get the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Check the rate limit for `key` as of `now_ms`.
    pub async fn allow_at(&self, key: &str, config: &RateLimitConfig, now_ms: i64) -> RateLimitDecision {
        let request = SlidingWindowRequest::new(key, config, now_ms, self.expiry_buffer);

        trace!(
            key = %key,
            limit = request.limit,
            window_ms = request.window_ms,
            "Checking distributed rate limit"
        );

        let reply = match tokio::time::timeout(self.timeout, self.backend.execute(&request)).await {
            Ok(Ok(raw)) => SlidingWindowReply::parse(&raw, config.limit()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ScenegateError::RateLimitBackend(format!(
                "no reply within {:?}",
                self.timeout
            ))),
        };

        match reply {
            Ok(reply) => {
                let decision = reply.into_decision();
                if !decision.allowed {
                    debug!(
                        key = %key,
                        limit = request.limit,
                        retry_after_secs = decision.retry_after_secs,
                        "Distributed rate limit exceeded"
                    );
                }
                decision
            }
            Err(e) => self.fail_open(key, config, &e),
        }
    }

    fn fail_open(&self, key: &str, config: &RateLimitConfig, error: &ScenegateError) -> RateLimitDecision {
        let total = self.fail_open_count.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(
            key = %key,
            error = %error,
            fail_open_total = total,
            "Rate limit backend unavailable, allowing request"
        );
        RateLimitDecision::allow(config.limit())
    }
}

#[async_trait]
impl<B: SlidingWindowBackend> RateLimitStore for SlidingWindowStore<B> {
    async fn allow(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.allow_at(key, config, unix_millis()).await
    }

    fn fail_open_count(&self) -> u64 {
        SlidingWindowStore::fail_open_count(self)
    }
}
