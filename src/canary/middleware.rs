//! HTTP middleware routing requests between cohorts.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::router::CanaryRouter;
use crate::ratelimit::{AuthenticatedUser, KeyStrategy};

/// Cohort that served the request.
pub const COHORT_HEADER: &str = "x-deployment-cohort";
/// Version label of the cohort that served the request.
pub const VERSION_HEADER: &str = "x-deployment-version";

/// Assign the request to a cohort and record its outcome.
///
/// The cohort is placed in request extensions so handlers can dispatch on it.
/// A response with a 5xx status counts as an error for the cohort.
pub async fn canary_route(
    State(router): State<Arc<CanaryRouter>>,
    mut req: Request,
    next: Next,
) -> Response {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string());
    let identity = KeyStrategy::User.derive(
        req.headers(),
        remote_addr.as_deref(),
        req.extensions().get::<AuthenticatedUser>(),
    );

    let cohort = router.assign(&identity);
    req.extensions_mut().insert(cohort);
    debug!(identity = %identity, cohort = %cohort, "Assigned cohort");

    let start = Instant::now();
    let mut response = next.run(req).await;
    let is_error = response.status().is_server_error();
    router.record(cohort, start.elapsed(), is_error);

    let headers = response.headers_mut();
    headers.insert(COHORT_HEADER, HeaderValue::from_static(cohort.as_str()));
    match HeaderValue::from_str(router.version_for(cohort)) {
        Ok(version) => {
            headers.insert(VERSION_HEADER, version);
        }
        Err(e) => warn!(error = %e, "Version label is not a valid header value"),
    }

    response
}
