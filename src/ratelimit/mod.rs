//! Rate limiting logic and state management.

mod backend;
mod counter;
mod distributed;
mod key;
mod limiter;
mod middleware;
mod redis_backend;
mod rules;

pub use backend::{RateLimitDecision, RateLimitStore};
pub use counter::{RateBucket, RateLimitConfig};
pub use distributed::{
    SlidingWindowBackend, SlidingWindowRequest, SlidingWindowStore, DEFAULT_BACKEND_TIMEOUT,
    DEFAULT_EXPIRY_BUFFER,
};
pub use key::{client_ip, ip_key, strip_port, user_key, AuthenticatedUser, KeyStrategy};
pub use limiter::InMemoryRateLimitStore;
pub use middleware::{rate_limit, RateLimitState, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER};
pub use redis_backend::RedisSlidingWindow;
pub use rules::{RateLimitPolicy, RateLimitRule, RateLimitRules, DEFAULT_RULE_NAME};
