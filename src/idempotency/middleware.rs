//! HTTP middleware enforcing idempotency keys.

use axum::body::{Body, Bytes};
use axum::extract::{MatchedPath, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use super::cache::{IdempotencyCache, IdempotencyOutcome, Reservation};
use super::key::extract_key;
use super::record::IdempotencyRecord;

/// Set on responses served from the cache.
pub const REPLAYED_HEADER: &str = "idempotent-replayed";

/// Run a protected POST at most once per idempotency key.
///
/// Requests that are not governed pass straight through. The handler's
/// response body is buffered so it can be stored; 2xx responses are kept and
/// replayed for later requests with the same key. A response larger than
/// `max_response_bytes` is streamed through uncached and its key released.
/// If the request is dropped before it finishes, the key is released too.
pub async fn idempotency(
    State(cache): State<Arc<IdempotencyCache>>,
    req: Request,
    next: Next,
) -> Response {
    let method = req.method().as_str().to_string();
    let route = req.uri().path().to_string();
    let template = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string());

    if !cache.is_protected(&method, &route, template.as_deref()) {
        return next.run(req).await;
    }

    let key = match extract_key(req.headers(), cache.config().max_key_length) {
        Ok(key) => key,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.code(), &e.to_string()),
    };

    let outcome = match cache.begin(&key, &method, &route).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(key = %key, error = %e, "Idempotency store unavailable");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "idempotency_store_unavailable",
                "Unable to verify idempotency key, please retry",
            );
        }
    };

    match outcome {
        IdempotencyOutcome::Execute => {}
        IdempotencyOutcome::Replay(record) => return replay(record),
        IdempotencyOutcome::InProgress => {
            return error_response(
                StatusCode::CONFLICT,
                "idempotency_key_in_progress",
                "A request with this Idempotency-Key is still being processed",
            )
        }
        IdempotencyOutcome::KeyReused => {
            return error_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                "idempotency_key_reused",
                "This Idempotency-Key was already used for a different request",
            )
        }
    }

    let reservation = Reservation::new(Arc::clone(&cache), key.clone());
    let response = next.run(req).await;
    let (parts, body) = response.into_parts();

    let bytes = match capture(body, cache.config().max_response_bytes).await {
        Ok(Captured::Complete(bytes)) => bytes,
        Ok(Captured::Oversized(body)) => {
            warn!(
                key = %key,
                max_bytes = cache.config().max_response_bytes,
                "Response too large to cache, releasing idempotency key"
            );
            cache.release(&key).await;
            reservation.disarm();
            return Response::from_parts(parts, body);
        }
        Err(e) => {
            error!(key = %key, error = %e, "Failed to read response body");
            cache.release(&key).await;
            reservation.disarm();
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Failed to read response",
            );
        }
    };

    if let Err(e) = cache
        .complete(&key, &method, &route, parts.status.as_u16(), bytes.to_vec())
        .await
    {
        error!(key = %key, error = %e, "Failed to store idempotency record");
        cache.release(&key).await;
    }
    reservation.disarm();

    Response::from_parts(parts, Body::from(bytes))
}

enum Captured {
    /// The whole body, within the limit
    Complete(Bytes),
    /// The body went past the limit; what was read is put back in front
    Oversized(Body),
}

/// Buffer `body` up to `limit` bytes.
async fn capture(body: Body, limit: usize) -> Result<Captured, axum::Error> {
    let mut data = body.into_data_stream();
    let mut buffered = Vec::new();

    while let Some(chunk) = data.next().await {
        let chunk = chunk?;
        if buffered.len() + chunk.len() > limit {
            let head = stream::iter([Ok::<_, axum::Error>(Bytes::from(buffered)), Ok(chunk)]);
            return Ok(Captured::Oversized(Body::from_stream(head.chain(data))));
        }
        buffered.extend_from_slice(&chunk);
    }

    Ok(Captured::Complete(Bytes::from(buffered)))
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.response_status_code).unwrap_or(StatusCode::OK);
    let mut response = (status, record.response_body).into_response();

    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(REPLAYED_HEADER, HeaderValue::from_static("true"));
    response
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "error": code, "message": message }))).into_response()
}
