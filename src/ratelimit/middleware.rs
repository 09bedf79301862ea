//! HTTP middleware enforcing rate limits.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;

use super::backend::{RateLimitDecision, RateLimitStore};
use super::key::AuthenticatedUser;
use super::rules::RateLimitRules;

/// Limit of the applied policy.
pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Quota left after the current request.
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Unix time at which a denied client may retry.
pub const RESET_HEADER: &str = "x-ratelimit-reset";

/// State shared by every invocation of the rate limit middleware.
#[derive(Clone)]
pub struct RateLimitState {
    store: Arc<dyn RateLimitStore>,
    rules: Arc<RateLimitRules>,
}

impl RateLimitState {
    /// Create middleware state from a store and a rules table.
    pub fn new(store: Arc<dyn RateLimitStore>, rules: RateLimitRules) -> Self {
        Self {
            store,
            rules: Arc::new(rules),
        }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    /// Get the rules table.
    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }
}

/// Rate limit a request before it reaches `next`.
///
/// Allowed requests get `X-RateLimit-Limit` and `X-RateLimit-Remaining` on
/// their response. Denied requests are answered with 429 and never forwarded.
pub async fn rate_limit(State(state): State<RateLimitState>, req: Request, next: Next) -> Response {
    let (rule_name, policy) = state.rules.policy_for(req.uri().path());
    let policy = *policy;

    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());
    let client_key = policy.key.derive(
        req.headers(),
        remote_addr.as_deref(),
        req.extensions().get::<AuthenticatedUser>(),
    );
    let key = format!("{}|{}", rule_name, client_key);

    let decision = state.store.allow(&key, &policy.limit).await;
    let limit = policy.limit.limit();

    if !decision.allowed {
        return too_many_requests(limit, &decision);
    }

    let mut response = next.run(req).await;
    insert_quota_headers(response.headers_mut(), limit, decision.remaining);
    response
}

fn too_many_requests(limit: u64, decision: &RateLimitDecision) -> Response {
    let reset_at = chrono::Utc::now().timestamp() + decision.retry_after_secs as i64;

    let body = Json(json!({
        "error": "rate_limit_exceeded",
        "message": "Too many requests, please try again later",
    }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();

    let headers = response.headers_mut();
    insert_quota_headers(headers, limit, 0);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    headers.insert(RESET_HEADER, HeaderValue::from(reset_at));
    response
}

fn insert_quota_headers(headers: &mut HeaderMap, limit: u64, remaining: u64) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
}
