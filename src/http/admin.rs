//! Administrative API for operating the governance layers.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::stack::GovernanceStack;
use crate::canary::MetricsSnapshot;

/// Reason recorded when a rollback request gives none.
pub const MANUAL_ROLLBACK_REASON: &str = "manual rollback";

/// Body of `POST /canary/rollback`.
#[derive(Debug, Default, Deserialize)]
pub struct RollbackRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// Reply to `POST /canary/rollback`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackResponse {
    /// Whether this call performed the rollback
    pub rolled_back: bool,
    pub active: bool,
    pub reason: Option<String>,
}

/// Counters of the rate limit and idempotency layers.
#[derive(Debug, Serialize, Deserialize)]
pub struct GovernanceStats {
    pub rate_limit_fail_opens: u64,
    pub idempotent_executions: u64,
    pub idempotent_replays: u64,
}

/// Build the admin router.
///
/// - `GET /health`
/// - `GET /canary/metrics`
/// - `POST /canary/rollback` with `{"reason": "..."}`
/// - `POST /canary/reset`
/// - `GET /stats`
pub fn admin_router(stack: GovernanceStack) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/canary/metrics", get(canary_metrics))
        .route("/canary/rollback", post(canary_rollback))
        .route("/canary/reset", post(canary_reset))
        .route("/stats", get(stats))
        .with_state(stack)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn canary_metrics(State(stack): State<GovernanceStack>) -> Json<MetricsSnapshot> {
    Json(stack.canary().snapshot())
}

async fn canary_rollback(
    State(stack): State<GovernanceStack>,
    Json(request): Json<RollbackRequest>,
) -> Json<RollbackResponse> {
    let reason = request
        .reason
        .map(|reason| reason.trim().to_string())
        .filter(|reason| !reason.is_empty())
        .unwrap_or_else(|| MANUAL_ROLLBACK_REASON.to_string());

    info!(reason = %reason, "Rollback requested through admin API");
    let canary = stack.canary();
    let rolled_back = canary.rollback(&reason);

    Json(RollbackResponse {
        rolled_back,
        active: canary.is_active(),
        reason: canary.rollback_reason(),
    })
}

async fn canary_reset(State(stack): State<GovernanceStack>) -> Json<MetricsSnapshot> {
    stack.canary().reset_metrics();
    Json(stack.canary().snapshot())
}

async fn stats(State(stack): State<GovernanceStack>) -> Json<GovernanceStats> {
    Json(GovernanceStats {
        rate_limit_fail_opens: stack.rate_limit().store().fail_open_count(),
        idempotent_executions: stack.idempotency().executions(),
        idempotent_replays: stack.idempotency().replays(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::{CanaryConfig, CanaryRouter, Cohort};
    use crate::idempotency::{IdempotencyCache, IdempotencyConfig, InMemoryIdempotencyStore};
    use crate::ratelimit::{InMemoryRateLimitStore, RateLimitRules, RateLimitState};
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::{header, StatusCode};
    use axum::response::Response;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn stack() -> GovernanceStack {
        GovernanceStack::new(
            RateLimitState::new(
                Arc::new(InMemoryRateLimitStore::new()),
                RateLimitRules::default(),
            ),
            Arc::new(
                CanaryRouter::new(CanaryConfig {
                    enabled: true,
                    traffic_percent: 20.0,
                    version: "v3".to_string(),
                    ..Default::default()
                })
                .unwrap(),
            ),
            Arc::new(
                IdempotencyCache::new(
                    Arc::new(InMemoryIdempotencyStore::new()),
                    IdempotencyConfig::default(),
                )
                .unwrap(),
            ),
        )
    }

    fn rollback_request(body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/canary/rollback")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = admin_router(stack())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let stack = stack();
        stack
            .canary()
            .record(Cohort::Canary, Duration::from_millis(100), true);

        let response = admin_router(stack)
            .oneshot(Request::builder().uri("/canary/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json(response).await;
        assert_eq!(body["active"], true);
        assert_eq!(body["version"], "v3");
        assert_eq!(body["canary"]["requests"], 1);
        assert_eq!(body["canary"]["errors"], 1);
        assert_eq!(body["canary"]["error_rate"], 100.0);
    }

    #[tokio::test]
    async fn test_rollback_once() {
        let stack = stack();
        let app = admin_router(stack.clone());

        let first = app
            .clone()
            .oneshot(rollback_request(r#"{"reason":"bad deploy"}"#))
            .await
            .unwrap();
        let first = json(first).await;
        assert_eq!(first["rolled_back"], true);
        assert_eq!(first["active"], false);
        assert_eq!(first["reason"], "bad deploy");

        let second = json(app.oneshot(rollback_request("{}")).await.unwrap()).await;
        assert_eq!(second["rolled_back"], false);
        assert_eq!(second["reason"], "bad deploy");

        assert!(!stack.canary().is_active());
    }

    #[tokio::test]
    async fn test_rollback_default_reason() {
        let stack = stack();

        admin_router(stack.clone())
            .oneshot(rollback_request(r#"{"reason":"  "}"#))
            .await
            .unwrap();

        assert_eq!(
            stack.canary().rollback_reason().as_deref(),
            Some(MANUAL_ROLLBACK_REASON)
        );
    }

    #[tokio::test]
    async fn test_reset_clears_metrics() {
        let stack = stack();
        stack
            .canary()
            .record(Cohort::Stable, Duration::from_millis(5), false);

        let response = admin_router(stack.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/canary/reset")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(json(response).await["stable"]["requests"], 0);
        assert_eq!(stack.canary().snapshot().stable.requests, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let response = admin_router(stack())
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = json(response).await;
        assert_eq!(body["rate_limit_fail_opens"], 0);
        assert_eq!(body["idempotent_executions"], 0);
    }
}
