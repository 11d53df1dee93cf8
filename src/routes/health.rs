//! Health probe endpoint for the external supervisor.
//!
//! Reports the monitor's latest snapshot without computing anything inline:
//! no database call, no lock beyond the watch channel read. `healthy` and
//! `degraded` answer 200 (degraded carries a body flag so dashboards can
//! tell them apart), `starting` and `unhealthy` answer 503.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::health::HealthStatus;
use crate::state::AppState;

#[derive(Serialize)]
struct HealthBody {
    status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    degraded: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state.health.borrow().clone();

    let code = if snapshot.status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = HealthBody {
        status: snapshot.status,
        degraded: (snapshot.status == HealthStatus::Degraded).then_some(true),
        reason: snapshot.reason,
    };

    (code, Json(body)).into_response()
}
