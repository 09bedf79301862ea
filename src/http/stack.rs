//! Composition of the governance middleware around an application router.

use axum::middleware::from_fn_with_state;
use axum::Router;
use std::sync::Arc;

use crate::canary::{canary_route, CanaryRouter};
use crate::idempotency::{idempotency, IdempotencyCache};
use crate::ratelimit::{rate_limit, RateLimitState};

/// The governance layers and the state they share.
///
/// Requests pass rate limiting first, so rejected clients never reach the
/// canary metrics or claim an idempotency key. Canary routing runs next and
/// idempotency last, next to the handler whose response it captures.
#[derive(Clone)]
pub struct GovernanceStack {
    rate_limit: RateLimitState,
    canary: Arc<CanaryRouter>,
    idempotency: Arc<IdempotencyCache>,
}

impl GovernanceStack {
    pub fn new(
        rate_limit: RateLimitState,
        canary: Arc<CanaryRouter>,
        idempotency: Arc<IdempotencyCache>,
    ) -> Self {
        Self {
            rate_limit,
            canary,
            idempotency,
        }
    }

    pub fn rate_limit(&self) -> &RateLimitState {
        &self.rate_limit
    }

    pub fn canary(&self) -> &Arc<CanaryRouter> {
        &self.canary
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyCache> {
        &self.idempotency
    }

    /// Wrap every route of `router` in the governance layers.
    pub fn apply(&self, router: Router) -> Router {
        // The layer added last runs first.
        router
            .layer(from_fn_with_state(self.idempotency.clone(), idempotency))
            .layer(from_fn_with_state(self.canary.clone(), canary_route))
            .layer(from_fn_with_state(self.rate_limit.clone(), rate_limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::{CanaryConfig, COHORT_HEADER};
    use crate::idempotency::{
        IdempotencyConfig, InMemoryIdempotencyStore, IDEMPOTENCY_KEY_HEADER, REPLAYED_HEADER,
    };
    use crate::ratelimit::{
        InMemoryRateLimitStore, KeyStrategy, RateLimitConfig, RateLimitPolicy, RateLimitRules,
        REMAINING_HEADER,
    };
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::routing::post;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;

    fn stack(limit: u64) -> GovernanceStack {
        let rules = RateLimitRules::new(RateLimitPolicy {
            limit: RateLimitConfig::new(limit, Duration::from_secs(60)).unwrap(),
            key: KeyStrategy::Ip,
        });
        let canary = CanaryRouter::new(CanaryConfig {
            enabled: true,
            traffic_percent: 100.0,
            version: "v2".to_string(),
            ..Default::default()
        })
        .unwrap();
        let idempotency = IdempotencyCache::new(
            Arc::new(InMemoryIdempotencyStore::new()),
            IdempotencyConfig {
                protected_routes: vec!["/orders".to_string()],
                ..Default::default()
            },
        )
        .unwrap();

        GovernanceStack::new(
            RateLimitState::new(Arc::new(InMemoryRateLimitStore::new()), rules),
            Arc::new(canary),
            Arc::new(idempotency),
        )
    }

    fn app(stack: &GovernanceStack, calls: Arc<AtomicUsize>) -> Router {
        let router = Router::new().route(
            "/orders",
            post(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                (StatusCode::CREATED, "{\"order\":1}")
            }),
        );
        stack.apply(router)
    }

    fn order(key: &str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/orders")
            .header("x-forwarded-for", "10.1.1.1")
            .header(IDEMPOTENCY_KEY_HEADER, key)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_all_layers_applied() {
        let stack = stack(10);
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(&stack, calls.clone());

        let first = app.clone().oneshot(order("order-1")).await.unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);
        assert_eq!(first.headers()[REMAINING_HEADER], "9");
        assert_eq!(first.headers()[COHORT_HEADER], "canary");

        let replay = app.oneshot(order("order-1")).await.unwrap();
        assert_eq!(replay.status(), StatusCode::CREATED);
        assert_eq!(replay.headers()[REPLAYED_HEADER], "true");
        assert_eq!(replay.headers()[COHORT_HEADER], "canary");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stack.canary().snapshot().canary.requests, 2);
        assert_eq!(stack.idempotency().replays(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_requests_stop_early() {
        let stack = stack(1);
        let calls = Arc::new(AtomicUsize::new(0));
        let app = app(&stack, calls.clone());

        app.clone().oneshot(order("order-1")).await.unwrap();
        let denied = app.oneshot(order("order-2")).await.unwrap();

        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(denied.headers().get(COHORT_HEADER).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stack.canary().snapshot().canary.requests, 1);
        assert_eq!(stack.idempotency().executions(), 1);
    }
}
