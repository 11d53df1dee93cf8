//! HTTP route handlers.
//!
//! Routes are grouped by caching behavior: tracking, stats, and the health
//! probe must never be cached, while the static site the tracker is embedded
//! in gets a long immutable cache. Every request runs under the per-request
//! deadline and inside the request-ID span.

pub mod health;
pub mod stats;
pub mod visits;

use axum::{
    handler::HandlerWithoutStateExt,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use http::header::{HeaderValue, CACHE_CONTROL};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;

use crate::config::{CACHE_CONTROL_NONE, CACHE_CONTROL_STATIC};
use crate::error::AppError;
use crate::middleware::request_span_layer;
use crate::state::AppState;

/// Creates the Axum router with all routes, the request deadline, and
/// per-group cache headers.
pub fn create_router(state: AppState) -> Router {
    // Tracking calls and the stats aggregate - never cached
    let api_routes = Router::new()
        .route(
            "/api/visit",
            post(visits::record_post).get(visits::record_get),
        )
        .route(
            "/api/log-visit",
            post(visits::record_post).get(visits::record_get),
        )
        .route("/api/stats", get(stats::stats))
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_NONE),
        ));

    // Health probe - always fresh, reads the monitor's cached snapshot
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_NONE),
        ));

    // Everything else is the tracked site itself: static files with a long
    // immutable cache, and a JSON 404 for misses
    let static_service = ServeDir::new(&state.config.http.static_dir)
        .call_fallback_on_method_not_allowed(true)
        .not_found_service(not_found.into_service());
    let static_routes = Router::new()
        .fallback_service(static_service)
        .layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static(CACHE_CONTROL_STATIC),
        ));

    Router::new()
        .merge(api_routes)
        .merge(health_routes)
        .merge(static_routes)
        .with_state(state.clone())
        // Per-request deadline: a handler cannot outlive it, and a request
        // always gets exactly one response
        .layer(TimeoutLayer::new(state.config.http.request_timeout()))
        // Request ID middleware - creates the root span for correlation
        .layer(middleware::from_fn(request_span_layer))
}

/// Unknown paths and static misses. Carries its own no-store header so the
/// static cache layer does not mark a 404 immutable.
async fn not_found() -> impl IntoResponse {
    (
        [(CACHE_CONTROL, HeaderValue::from_static(CACHE_CONTROL_NONE))],
        AppError::NotFound,
    )
}
