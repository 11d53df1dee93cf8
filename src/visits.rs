//! Visit recording and statistics.
//!
//! A recorded visit is one [`VisitEntry`]: server-side request facts (time,
//! method, client IP, request path) merged with whatever the tracking snippet
//! supplied (page path, referrer, event name, session). Entries are written to
//! PostgreSQL through the database gateway and mirrored to the log shipper;
//! the aggregate counters behind `/api/stats` come from one grouped query and
//! are cached briefly so dashboard polling cannot stampede the database.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::Row;
use tracing::instrument;

use crate::config::{TrackingConfig, TRACKING_DEFAULT_EVENT};
use crate::db::{DbError, Gateway, PgConnector};
use crate::shipper::ShipperHandle;

/// Client-supplied fields of a tracking call.
///
/// Everything is optional; a bare `{}` body is a valid visit. Absent fields
/// become empty strings except `event`, which defaults to `"visit"` so that
/// plain page loads count in the visit totals.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisitPayload {
    pub path: String,
    pub referrer: String,
    pub user_agent: String,
    pub event: String,
    pub session_id: String,
    /// Epoch milliseconds of the session start, as reported by the client
    pub session_started: i64,
    pub utm: String,
}

impl Default for VisitPayload {
    fn default() -> Self {
        Self {
            path: String::new(),
            referrer: String::new(),
            user_agent: String::new(),
            event: TRACKING_DEFAULT_EVENT.to_string(),
            session_id: String::new(),
            session_started: 0,
            utm: String::new(),
        }
    }
}

/// One recorded tracking event, as stored and shipped.
///
/// Serializes with camelCase keys; this is the wire format of the visit log
/// and the forward endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitEntry {
    /// Server receive time; client-supplied timestamps are never trusted
    pub ts: DateTime<Utc>,
    pub method: String,
    pub ip: String,
    /// Path the tracking call itself hit, e.g. `/api/visit`
    pub request_path: String,
    pub path: String,
    pub referrer: String,
    pub user_agent: String,
    pub event: String,
    pub session_id: String,
    pub session_started: i64,
    pub utm: String,
    /// Raw client payload as received
    pub payload: Value,
}

impl VisitEntry {
    pub fn build(
        method: &str,
        ip: String,
        request_path: String,
        payload: VisitPayload,
        raw: Value,
    ) -> Self {
        Self {
            ts: Utc::now(),
            method: method.to_string(),
            ip,
            request_path,
            path: payload.path,
            referrer: payload.referrer,
            user_agent: payload.user_agent,
            event: payload.event,
            session_id: payload.session_id,
            session_started: payload.session_started,
            utm: payload.utm,
            payload: raw,
        }
    }
}

/// Aggregate counters served by `/api/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitStats {
    pub total_events: i64,
    pub visits: i64,
    pub clicks: i64,
    pub exits: i64,
    pub unique_sessions: i64,
    pub visits_today: i64,
    pub clicks_today: i64,
}

/// Persistence seam for visit entries.
#[async_trait]
pub trait VisitStore: Send + Sync {
    /// Create the backing table if it does not exist.
    async fn init_schema(&self) -> Result<(), DbError>;

    async fn record(&self, entry: &VisitEntry) -> Result<(), DbError>;

    async fn stats(&self) -> Result<VisitStats, DbError>;
}

const CREATE_VISITS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS visits (
    id BIGSERIAL PRIMARY KEY,
    ts TIMESTAMPTZ,
    method TEXT,
    ip TEXT,
    request_path TEXT,
    path TEXT,
    referrer TEXT,
    user_agent TEXT,
    event TEXT,
    session_id TEXT,
    session_started BIGINT,
    utm TEXT,
    payload JSONB
)"#;

const INSERT_VISIT_SQL: &str = r#"
INSERT INTO visits
    (ts, method, ip, request_path, path, referrer, user_agent, event,
     session_id, session_started, utm, payload)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#;

// One round trip for all seven counters
const STATS_SQL: &str = r#"
SELECT
    COUNT(*)                                                            AS total_events,
    COUNT(*) FILTER (WHERE event = 'visit')                             AS visits,
    COUNT(*) FILTER (WHERE event = 'click')                             AS clicks,
    COUNT(*) FILTER (WHERE event = 'exit')                              AS exits,
    COUNT(DISTINCT session_id)                                          AS unique_sessions,
    COUNT(*) FILTER (WHERE event = 'visit' AND ts::date = CURRENT_DATE) AS visits_today,
    COUNT(*) FILTER (WHERE event = 'click' AND ts::date = CURRENT_DATE) AS clicks_today
FROM visits"#;

/// PostgreSQL-backed store running everything through the gateway.
#[derive(Clone)]
pub struct PgVisitStore {
    gateway: Gateway<PgConnector>,
}

impl PgVisitStore {
    pub fn new(gateway: Gateway<PgConnector>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl VisitStore for PgVisitStore {
    async fn init_schema(&self) -> Result<(), DbError> {
        self.gateway
            .execute("init_schema", |conn| {
                Box::pin(async move {
                    sqlx::query(CREATE_VISITS_SQL).execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .await
    }

    async fn record(&self, entry: &VisitEntry) -> Result<(), DbError> {
        let entry = entry.clone();
        self.gateway
            .execute("insert_visit", move |conn| {
                let entry = entry.clone();
                Box::pin(async move {
                    sqlx::query(INSERT_VISIT_SQL)
                        .bind(entry.ts)
                        .bind(&entry.method)
                        .bind(&entry.ip)
                        .bind(&entry.request_path)
                        .bind(&entry.path)
                        .bind(&entry.referrer)
                        .bind(&entry.user_agent)
                        .bind(&entry.event)
                        .bind(&entry.session_id)
                        .bind(entry.session_started)
                        .bind(&entry.utm)
                        .bind(&entry.payload)
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    async fn stats(&self) -> Result<VisitStats, DbError> {
        self.gateway
            .execute("stats", |conn| {
                Box::pin(async move {
                    let row = sqlx::query(STATS_SQL).fetch_one(&mut *conn).await?;
                    Ok(VisitStats {
                        total_events: row.try_get("total_events")?,
                        visits: row.try_get("visits")?,
                        clicks: row.try_get("clicks")?,
                        exits: row.try_get("exits")?,
                        unique_sessions: row.try_get("unique_sessions")?,
                        visits_today: row.try_get("visits_today")?,
                        clicks_today: row.try_get("clicks_today")?,
                    })
                })
            })
            .await
    }
}

/// Request-facing facade over the store, the shipper, and the stats cache.
#[derive(Clone)]
pub struct VisitService {
    store: Arc<dyn VisitStore>,
    shipper: ShipperHandle,
    stats_cache: Cache<String, VisitStats>,
}

impl VisitService {
    pub fn new(store: Arc<dyn VisitStore>, shipper: ShipperHandle, config: &TrackingConfig) -> Self {
        let stats_cache = Cache::builder()
            .max_capacity(1) // a single aggregate lives here
            .time_to_live(config.stats_cache_ttl())
            .build();
        Self {
            store,
            shipper,
            stats_cache,
        }
    }

    /// Persist one entry. The shipper copy is fire-and-forget; the database
    /// write is authoritative and its errors propagate to the handler.
    #[instrument(name = "visits.record", skip_all, fields(event = %entry.event, path = %entry.path))]
    pub async fn record(&self, entry: VisitEntry) -> Result<(), DbError> {
        self.shipper.enqueue(entry.clone());
        self.store.record(&entry).await
    }

    #[instrument(name = "visits.stats", skip_all)]
    pub async fn stats(&self) -> Result<VisitStats, DbError> {
        let cache_key = "aggregate".to_string();
        if let Some(stats) = self.stats_cache.get(&cache_key).await {
            return Ok(stats);
        }

        let stats = self.store.stats().await?;
        self.stats_cache.insert(cache_key, stats.clone()).await;
        Ok(stats)
    }
}
