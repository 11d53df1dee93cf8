//! Request span middleware.
//!
//! Tags every request with a UUID v4 and wraps its whole lifecycle in one
//! tracing span, so every log line emitted while handling it carries the same
//! `request_id`. The span records the response status and total duration, and
//! a completion line is logged when the response is ready. Tracking calls are
//! fire-and-forget from the client's point of view, which makes this span the
//! only place a failed visit is visible end to end.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Request extension carrying the generated ID, for handlers that want to
/// echo it.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Outermost layer: everything below it, other middleware included, runs
/// inside the request span.
pub async fn request_span_layer(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
        status = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );

    request.extensions_mut().insert(RequestId(request_id));
    let start = Instant::now();

    async move {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let span = tracing::Span::current();
        span.record("status", response.status().as_u16());
        span.record("duration_ms", duration_ms);
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms,
            "Request completed"
        );

        response
    }
    .instrument(span)
    .await
}
