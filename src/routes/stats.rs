//! Aggregate counters endpoint.

use axum::extract::State;
use axum::Json;

use crate::error::AppError;
use crate::state::AppState;
use crate::visits::VisitStats;

/// `GET /api/stats`. Counters come from the short-lived aggregate cache, so
/// a dashboard polling this endpoint does not turn into database load.
pub async fn stats(State(state): State<AppState>) -> Result<Json<VisitStats>, AppError> {
    Ok(Json(state.visits.stats().await?))
}
