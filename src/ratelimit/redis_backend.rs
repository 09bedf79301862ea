//! Redis implementation of the atomic sliding-window step.

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{Client, Script};
use tracing::info;

use super::distributed::{SlidingWindowBackend, SlidingWindowRequest};
use crate::error::{Result, ScenegateError};

/// Expire, count and conditionally insert in one server-side step.
///
/// Members are `<now_ms>-<seq>` where `seq` comes from a per-key counter, so
/// two requests landing in the same millisecond stay two entries. Both keys
/// share a hash tag so they land in the same cluster slot.
///
/// Reply: `{allowed, remaining, retry_after_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local seq_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    local seq = redis.call('INCR', seq_key)
    redis.call('ZADD', key, now, now .. '-' .. seq)
    redis.call('PEXPIRE', key, ttl)
    redis.call('PEXPIRE', seq_key, ttl)
    return {1, limit - count - 1, 0}
end

local retry = window
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
end
if retry < 0 then
    retry = 0
end
return {0, 0, retry}
"#;

/// Sliding-window backend that runs a Lua script against Redis.
#[derive(Clone)]
pub struct RedisSlidingWindow {
    connection: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl RedisSlidingWindow {
    /// Connect to Redis at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let config = ConnectionManagerConfig::new().set_number_of_retries(1);
        let connection = client.get_connection_manager_with_config(config).await?;

        info!("Connected to rate limit cache");

        Ok(Self::with_connection(connection))
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            key_prefix: "ratelimit".to_string(),
        }
    }

    /// Set the namespace prepended to every cache key.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Cache keys for the ordered set and its sequence counter.
fn cache_keys(prefix: &str, key: &str) -> (String, String) {
    let set_key = format!("{}:{{{}}}", prefix, key);
    let seq_key = format!("{}:seq", set_key);
    (set_key, seq_key)
}

#[async_trait]
impl SlidingWindowBackend for RedisSlidingWindow {
    async fn execute(&self, request: &SlidingWindowRequest) -> Result<Vec<i64>> {
        let (set_key, seq_key) = cache_keys(&self.key_prefix, &request.key);
        let mut connection = self.connection.clone();

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(set_key)
            .key(seq_key)
            .arg(request.now_ms)
            .arg(request.window_ms)
            .arg(request.limit)
            .arg(request.ttl_ms);

        let reply: Vec<i64> = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|e| ScenegateError::RateLimitBackend(e.to_string()))?;

        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys_share_hash_tag() {
        let (set_key, seq_key) = cache_keys("ratelimit", "ip:10.0.0.1");
        assert_eq!(set_key, "ratelimit:{ip:10.0.0.1}");
        assert_eq!(seq_key, "ratelimit:{ip:10.0.0.1}:seq");
    }

    #[test]
    fn test_script_touches_only_its_keys() {
        assert!(SLIDING_WINDOW_SCRIPT.contains("KEYS[1]"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("KEYS[2]"));
        assert!(!SLIDING_WINDOW_SCRIPT.contains("KEYS[3]"));
        assert!(SLIDING_WINDOW_SCRIPT.contains("now .. '-' .. seq"));
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn request(key: &str, now_ms: i64) -> SlidingWindowRequest {
        SlidingWindowRequest {
            key: key.to_string(),
            now_ms,
            window_ms: 1_000,
            limit: 3,
            ttl_ms: 2_000,
        }
    }

    #[tokio::test]
    #[ignore = "needs a running Redis, set REDIS_URL"]
    async fn test_script_against_live_redis() {
        let prefix = format!("scenegate-test-{}", uuid::Uuid::new_v4());
        let backend = RedisSlidingWindow::connect(&redis_url())
            .await
            .unwrap()
            .with_key_prefix(prefix.clone());
        let (set_key, seq_key) = cache_keys(&prefix, "ip:10.0.0.1");
        let mut connection = backend.connection.clone();
        let now = 1_000_000;

        // Same millisecond: each accepted request is its own entry.
        assert_eq!(backend.execute(&request("ip:10.0.0.1", now)).await.unwrap(), vec![1, 2, 0]);
        assert_eq!(backend.execute(&request("ip:10.0.0.1", now)).await.unwrap(), vec![1, 1, 0]);
        assert_eq!(backend.execute(&request("ip:10.0.0.1", now)).await.unwrap(), vec![1, 0, 0]);
        let entries: i64 = redis::cmd("ZCARD").arg(&set_key).query_async(&mut connection).await.unwrap();
        assert_eq!(entries, 3);

        // Full: retry is measured from the oldest entry.
        assert_eq!(backend.execute(&request("ip:10.0.0.1", now)).await.unwrap(), vec![0, 0, 1_000]);
        assert_eq!(
            backend.execute(&request("ip:10.0.0.1", now + 400)).await.unwrap(),
            vec![0, 0, 600]
        );
        let entries: i64 = redis::cmd("ZCARD").arg(&set_key).query_async(&mut connection).await.unwrap();
        assert_eq!(entries, 3);

        let ttl: i64 = redis::cmd("PTTL").arg(&set_key).query_async(&mut connection).await.unwrap();
        assert!(ttl > 0 && ttl <= 2_000);

        // Entries scored exactly `now - window` are already outside the window.
        assert_eq!(
            backend.execute(&request("ip:10.0.0.1", now + 1_000)).await.unwrap(),
            vec![1, 2, 0]
        );
        let entries: i64 = redis::cmd("ZCARD").arg(&set_key).query_async(&mut connection).await.unwrap();
        assert_eq!(entries, 1);

        let _: i64 = redis::cmd("DEL")
            .arg(&set_key)
            .arg(&seq_key)
            .query_async(&mut connection)
            .await
            .unwrap();
    }
}
