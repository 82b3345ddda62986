//! Request tracing middleware

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Log each request with timing inside a span carrying its request id.
///
/// An incoming `x-request-id` is reused, otherwise one is generated; either
/// way it is echoed on the response so a support report can be matched to
/// the engine's log lines.
pub async fn request_tracing(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get(&REQUEST_ID)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::info_span!("request", request_id = %request_id, method = %method, path = %path);
    let start = Instant::now();

    let mut response = async {
        tracing::debug!("Request started");
        next.run(request).await
    }
    .instrument(span.clone())
    .await;

    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    span.in_scope(|| {
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), duration_ms, "Request failed");
        } else if status.is_client_error() {
            tracing::warn!(status = status.as_u16(), duration_ms, "Request rejected");
        } else {
            tracing::info!(status = status.as_u16(), duration_ms, "Request completed");
        }
    });

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    response
}
