//! In-process fixed-window rate limit store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::backend::{RateLimitDecision, RateLimitStore};
use super::counter::{RateBucket, RateLimitConfig};

/// Fixed-window rate limit store held in process memory.
///
/// Buckets live in a sharded map. The check-then-increment for one key runs
/// while that key's shard is write-locked, so concurrent callers can never
/// both observe spare quota and both increment past the limit.
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    /// Fixed-window buckets indexed by rate limit key
    buckets: DashMap<String, RateBucket>,
}

impl InMemoryRateLimitStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Check the rate limit for `key` as of `now`.
    pub fn allow_at(&self, key: &str, config: &RateLimitConfig, now: Instant) -> RateLimitDecision {
        let limit = config.limit();

        match self.buckets.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                trace!(key = %key, limit = limit, "Creating new rate limit bucket");
                vacant.insert(RateBucket::open(now, config.window()));
                RateLimitDecision::allow(limit - 1)
            }
            Entry::Occupied(mut occupied) => {
                let bucket = occupied.get_mut();

                if bucket.is_expired(now) {
                    *bucket = RateBucket::open(now, config.window());
                    return RateLimitDecision::allow(limit - 1);
                }

                if bucket.try_increment(limit) {
                    RateLimitDecision::allow(limit - bucket.count())
                } else {
                    let retry_after = bucket.retry_after_secs(now);
                    debug!(
                        key = %key,
                        limit = limit,
                        retry_after_secs = retry_after,
                        "Rate limit exceeded"
                    );
                    RateLimitDecision::deny(retry_after)
                }
            }
        }
    }

    /// Remove every bucket whose window closed before `now`.
    ///
    /// Returns the number of buckets removed.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, "Removed expired rate limit buckets");
        }
        removed
    }

    /// Remove every bucket whose window has closed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until the handle is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.cleanup();
            }
        })
    }

    /// Get the current count for a key, if it has a live bucket.
    pub fn get_count(&self, key: &str) -> Option<u64> {
        self.buckets.get(key).map(|bucket| bucket.count())
    }

    /// Get the number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn allow(&self, key: &str, config: &RateLimitConfig) -> RateLimitDecision {
        self.allow_at(key, config, Instant::now())
    }
}
