//! Tracking endpoints.
//!
//! `POST /api/visit` (and its older alias `/api/log-visit`) takes an arbitrary
//! JSON body from the tracking snippet; `GET /api/visit` does the same job via
//! query parameters for clients that can only emit an image-style beacon. Both
//! answer 204 with no body.
//!
//! The POST body is deliberately forgiving: tracking calls come from whatever
//! the page manages to send, so a malformed, oversized, or empty body is
//! recorded as an empty payload instead of being rejected. A visit is only
//! refused when the database write itself fails.

use axum::extract::{Query, Request, State};
use axum::http::{Extensions, HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::{TRACKING_DEFAULT_EVENT, TRACKING_MAX_BODY_BYTES};
use crate::error::AppError;
use crate::state::AppState;
use crate::visits::{VisitEntry, VisitPayload};

/// Query-parameter form of a tracking call, with the short names the beacon
/// variant uses (`ua`, `sid`).
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct VisitQuery {
    path: String,
    referrer: String,
    ua: String,
    event: Option<String>,
    sid: String,
    utm: String,
}

impl From<VisitQuery> for VisitPayload {
    fn from(query: VisitQuery) -> Self {
        Self {
            path: query.path,
            referrer: query.referrer,
            user_agent: query.ua,
            event: query
                .event
                .unwrap_or_else(|| TRACKING_DEFAULT_EVENT.to_string()),
            session_id: query.sid,
            session_started: 0,
            utm: query.utm,
        }
    }
}

pub async fn record_post(
    State(state): State<AppState>,
    request: Request,
) -> Result<StatusCode, AppError> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, TRACKING_MAX_BODY_BYTES)
        .await
        .unwrap_or_default();

    let raw: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| json!({}));
    let payload: VisitPayload = serde_json::from_value(raw.clone()).unwrap_or_default();

    let entry = VisitEntry::build(
        parts.method.as_str(),
        client_ip(&parts.headers, &parts.extensions),
        parts.uri.path().to_string(),
        payload,
        raw,
    );
    state.visits.record(entry).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn record_get(
    State(state): State<AppState>,
    Query(query): Query<VisitQuery>,
    request: Request,
) -> Result<StatusCode, AppError> {
    let (parts, _) = request.into_parts();
    let payload = VisitPayload::from(query);
    let raw = json!({
        "path": payload.path,
        "referrer": payload.referrer,
        "userAgent": payload.user_agent,
        "event": payload.event,
        "sessionId": payload.session_id,
        "utm": payload.utm,
    });

    let entry = VisitEntry::build(
        parts.method.as_str(),
        client_ip(&parts.headers, &parts.extensions),
        parts.uri.path().to_string(),
        payload,
        raw,
    );
    state.visits.record(entry).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Client address as recorded: first `x-forwarded-for` entry when the
/// service sits behind a proxy, otherwise the socket peer, otherwise empty.
fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> String {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
    {
        return first.to_string();
    }

    extensions
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_default()
}
