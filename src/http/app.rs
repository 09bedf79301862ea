//! Application routes served behind the governance stack.

use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::{json, Value};

use crate::canary::Cohort;

/// Build the application router.
///
/// - `GET /health`
/// - `POST /echo` returns the JSON body it was given together with the
///   cohort that served it
pub fn app_router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/echo", post(echo))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn echo(Extension(cohort): Extension<Cohort>, Json(body): Json<Value>) -> Json<Value> {
    Json(json!({ "cohort": cohort, "echo": body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::{header, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_echo_reports_cohort() {
        let app = app_router().layer(Extension(Cohort::Stable));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/echo")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"n":1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["cohort"], "stable");
        assert_eq!(body["echo"]["n"], 1);
    }
}
