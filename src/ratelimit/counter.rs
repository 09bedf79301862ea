//! Rate limit configuration and fixed-window bucket state.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{Result, ScenegateError};

/// A validated rate limit: at most `requests_per_window` requests per `window`.
///
/// Both fields are strictly positive. [`RateLimitConfig::new`] and
/// deserialization both reject zeros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRateLimitConfig", into = "RawRateLimitConfig")]
pub struct RateLimitConfig {
    requests_per_window: u64,
    window: Duration,
}

/// Wire form of [`RateLimitConfig`] as it appears in configuration files.
///
/// Exactly one of `window_secs` and `window_ms` is set. Whole-second windows
/// are written as `window_secs`, anything finer as `window_ms`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawRateLimitConfig {
    requests_per_window: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    window_ms: Option<u64>,
}

impl TryFrom<RawRateLimitConfig> for RateLimitConfig {
    type Error = ScenegateError;

    fn try_from(raw: RawRateLimitConfig) -> Result<Self> {
        let window = match (raw.window_secs, raw.window_ms) {
            (Some(secs), None) => Duration::from_secs(secs),
            (None, Some(ms)) => Duration::from_millis(ms),
            (None, None) => {
                return Err(ScenegateError::Config(
                    "rate limit needs window_secs or window_ms".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(ScenegateError::Config(
                    "rate limit takes only one of window_secs and window_ms".to_string(),
                ))
            }
        };
        RateLimitConfig::new(raw.requests_per_window, window)
    }
}

impl From<RateLimitConfig> for RawRateLimitConfig {
    fn from(config: RateLimitConfig) -> Self {
        let (window_secs, window_ms) = if config.window.subsec_nanos() == 0 {
            (Some(config.window.as_secs()), None)
        } else {
            (None, Some(config.window.as_millis() as u64))
        };
        Self {
            requests_per_window: config.requests_per_window,
            window_secs,
            window_ms,
        }
    }
}

impl RateLimitConfig {
    /// Create a validated rate limit config.
    pub fn new(requests_per_window: u64, window: Duration) -> Result<Self> {
        if requests_per_window == 0 {
            return Err(ScenegateError::Config(
                "requests_per_window must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(ScenegateError::Config(
                "rate limit window must be greater than zero".to_string(),
            ));
        }
        if window.subsec_nanos() % 1_000_000 != 0 {
            return Err(ScenegateError::Config(
                "rate limit window must be a whole number of milliseconds".to_string(),
            ));
        }
        Ok(Self {
            requests_per_window,
            window,
        })
    }

    /// Maximum number of requests accepted per window.
    pub fn limit(&self) -> u64 {
        self.requests_per_window
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimitConfig {
    /// 100 requests per minute.
    fn default() -> Self {
        Self {
            requests_per_window: 100,
            window: Duration::from_secs(60),
        }
    }
}

/// Fixed-window counter for a single key.
///
/// Buckets are owned by the in-memory store and never handed out.
#[derive(Debug, Clone, Copy)]
pub struct RateBucket {
    /// Requests accepted in the current window
    count: u64,
    /// When the current window closes
    window_end: Instant,
}

impl RateBucket {
    /// Open a new window with the first request already counted.
    pub fn open(now: Instant, window: Duration) -> Self {
        Self {
            count: 1,
            window_end: now + window,
        }
    }

    /// Whether the window has closed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.window_end
    }

    /// Requests accepted in the current window.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Try to count one more request against `limit`.
    ///
    /// Returns `false` without changing the count when the bucket is full.
    pub fn try_increment(&mut self, limit: u64) -> bool {
        if self.count < limit {
            self.count += 1;
            true
        } else {
            false
        }
    }

    /// Whole seconds until the window closes, never less than one.
    pub fn retry_after_secs(&self, now: Instant) -> u64 {
        let left = self.window_end.saturating_duration_since(now);
        let mut secs = left.as_secs();
        if left.subsec_nanos() > 0 {
            secs += 1;
        }
        secs.max(1)
    }
}
