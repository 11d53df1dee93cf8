//! Service health tracking.
//!
//! A monitor task periodically folds the pool gauge and the gateway outcome
//! counters into one of four statuses and publishes the result over a watch
//! channel. Handlers read the latest snapshot without blocking; nothing on the
//! request path computes liveness inline, so the status is at most one
//! monitoring interval behind reality.
//!
//! Status transitions:
//! - `starting → healthy` once the pool has validated a connection and the
//!   listener is accepting
//! - `healthy → degraded` when too many recent gateway calls failed with
//!   connection loss or timeout
//! - `degraded → healthy` after a run of clean intervals
//! - `* → unhealthy` when the pool has been empty longer than the grace
//!   period; back to `healthy` as soon as it holds a connection again

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tracing::instrument;

use crate::config::HealthConfig;
use crate::db::{PoolGauge, PoolStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Starting => "starting",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Whether the service should answer readiness probes positively.
    pub fn is_ready(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the monitor last concluded, published to handlers.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    /// Human-readable cause for a non-healthy status
    pub reason: Option<String>,
    /// When this status was entered
    pub since: DateTime<Utc>,
}

impl HealthSnapshot {
    fn starting() -> Self {
        Self {
            status: HealthStatus::Starting,
            reason: None,
            since: Utc::now(),
        }
    }
}

/// Gateway outcome counters, swapped out by the monitor every interval.
///
/// A success means the database answered, including answering with a
/// rejection; a failure means connection loss or timeout. Capacity errors
/// (pool exhausted, shutdown) say nothing about the database and are not
/// recorded.
#[derive(Debug, Default)]
pub struct HealthRecorder {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl HealthRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn take_window(&self) -> OutcomeWindow {
        OutcomeWindow {
            successes: self.successes.swap(0, Ordering::Relaxed),
            failures: self.failures.swap(0, Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64) {
        (
            self.successes.load(Ordering::Relaxed),
            self.failures.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct OutcomeWindow {
    successes: u64,
    failures: u64,
}

impl OutcomeWindow {
    fn total(&self) -> u64 {
        self.successes + self.failures
    }

    fn breaches(&self, ratio: f64) -> bool {
        self.total() > 0 && (self.failures as f64 / self.total() as f64) >= ratio
    }
}

/// Periodic evaluator that owns the state machine.
pub struct HealthMonitor {
    gauge: PoolGauge,
    recorder: Arc<HealthRecorder>,
    config: HealthConfig,
    accepting: Arc<AtomicBool>,
    tx: watch::Sender<HealthSnapshot>,
    status: HealthStatus,
    started_at: Instant,
    clean_streak: u32,
}

impl HealthMonitor {
    pub fn new(gauge: PoolGauge, recorder: Arc<HealthRecorder>, config: HealthConfig) -> Self {
        let (tx, _) = watch::channel(HealthSnapshot::starting());
        Self {
            gauge,
            recorder,
            config,
            accepting: Arc::new(AtomicBool::new(false)),
            tx,
            status: HealthStatus::Starting,
            started_at: Instant::now(),
            clean_streak: 0,
        }
    }

    /// Receiver for the published snapshot; clone freely.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.tx.subscribe()
    }

    /// Flag the service process raises once the listener is bound.
    pub fn accepting_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.accepting)
    }

    /// Run until `shutdown` fires, evaluating once per interval.
    #[instrument(name = "health.monitor", skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!(interval_secs = self.config.check_interval_seconds, "Health monitor starting");
        let mut ticker = interval(self.config.check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => self.evaluate(),
                _ = shutdown.changed() => {
                    tracing::debug!("Health monitor stopping");
                    break;
                }
            }
        }
    }

    /// One evaluation round: read the gauge, swap the outcome window, step
    /// the state machine, publish on change.
    fn evaluate(&mut self) {
        let pool = self.gauge.status();
        let window = self.recorder.take_window();

        let (next, reason) = self.next_status(&pool, &window);
        if next != self.status {
            tracing::info!(
                from = %self.status,
                to = %next,
                reason = reason.as_deref().unwrap_or(""),
                "Health status changed"
            );
            if next == HealthStatus::Degraded {
                self.clean_streak = 0;
            }
            self.status = next;
            self.tx.send_replace(HealthSnapshot {
                status: next,
                reason,
                since: Utc::now(),
            });
        }
    }

    fn next_status(&mut self, pool: &PoolStatus, window: &OutcomeWindow) -> (HealthStatus, Option<String>) {
        // An empty pool past the grace period overrides everything else.
        let last_alive = pool.last_success.unwrap_or(self.started_at);
        if pool.open == 0 && last_alive.elapsed() >= self.config.unhealthy_grace() {
            return (
                HealthStatus::Unhealthy,
                Some(format!(
                    "no database connection for {}s",
                    last_alive.elapsed().as_secs()
                )),
            );
        }

        match self.status {
            HealthStatus::Starting => {
                if pool.ever_validated && self.accepting.load(Ordering::SeqCst) {
                    (HealthStatus::Healthy, None)
                } else {
                    (HealthStatus::Starting, None)
                }
            }
            HealthStatus::Healthy => {
                if window.breaches(self.config.degraded_failure_ratio) {
                    (
                        HealthStatus::Degraded,
                        Some(format!(
                            "{}/{} recent database calls failed",
                            window.failures,
                            window.total()
                        )),
                    )
                } else {
                    (HealthStatus::Healthy, None)
                }
            }
            HealthStatus::Degraded => {
                if window.failures == 0 {
                    self.clean_streak += 1;
                } else {
                    self.clean_streak = 0;
                }
                if self.clean_streak >= self.config.recovery_intervals {
                    (HealthStatus::Healthy, None)
                } else {
                    (HealthStatus::Degraded, self.tx.borrow().reason.clone())
                }
            }
            HealthStatus::Unhealthy => {
                if pool.open > 0 {
                    (HealthStatus::Healthy, None)
                } else {
                    (HealthStatus::Unhealthy, self.tx.borrow().reason.clone())
                }
            }
        }
    }

    #[cfg(test)]
    fn current(&self) -> HealthStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::MockConnector;
    use crate::db::{ConnectionPool, PoolConfig};
    use std::sync::atomic::Ordering::SeqCst;
    use std::time::Duration;

    fn test_config() -> HealthConfig {
        HealthConfig {
            check_interval_seconds: 5,
            unhealthy_grace_seconds: 30,
            degraded_failure_ratio: 0.5,
            recovery_intervals: 2,
        }
    }

    fn pool(connector: &std::sync::Arc<MockConnector>) -> ConnectionPool<std::sync::Arc<MockConnector>> {
        ConnectionPool::new(
            std::sync::Arc::clone(connector),
            PoolConfig {
                max_size: 2,
                min_idle: 1,
                idle_timeout: Duration::from_secs(300),
            },
        )
    }

    async fn validate_pool<C: crate::db::Connector>(pool: &ConnectionPool<C>) {
        let lease = pool.acquire(Duration::from_millis(100)).await.unwrap();
        drop(lease);
    }

    #[tokio::test]
    async fn test_initial_snapshot_is_starting() {
        let connector = MockConnector::new();
        let monitor = HealthMonitor::new(pool(&connector).gauge(), HealthRecorder::new(), test_config());
        let rx = monitor.subscribe();
        assert_eq!(rx.borrow().status, HealthStatus::Starting);
        assert!(!rx.borrow().status.is_ready());
    }

    #[tokio::test]
    async fn test_starting_becomes_healthy_once_validated_and_accepting() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut monitor = HealthMonitor::new(pool.gauge(), HealthRecorder::new(), test_config());

        validate_pool(&pool).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Starting, "not accepting yet");

        monitor.accepting_flag().store(true, SeqCst);
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);
        assert_eq!(monitor.subscribe().borrow().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failure_ratio_degrades_and_recovers() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let recorder = HealthRecorder::new();
        let mut monitor = HealthMonitor::new(pool.gauge(), Arc::clone(&recorder), test_config());
        monitor.accepting_flag().store(true, SeqCst);
        validate_pool(&pool).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);

        recorder.record_failure();
        recorder.record_failure();
        recorder.record_success();
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Degraded);
        let snapshot = monitor.subscribe().borrow().clone();
        assert!(snapshot.reason.unwrap().contains("2/3"));

        // two clean intervals to recover
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Degraded);
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_failures_below_threshold_stay_healthy() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let recorder = HealthRecorder::new();
        let mut monitor = HealthMonitor::new(pool.gauge(), Arc::clone(&recorder), test_config());
        monitor.accepting_flag().store(true, SeqCst);
        validate_pool(&pool).await;
        monitor.evaluate();

        recorder.record_failure();
        recorder.record_success();
        recorder.record_success();
        recorder.record_success();
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_dirty_interval_resets_recovery_streak() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let recorder = HealthRecorder::new();
        let mut monitor = HealthMonitor::new(pool.gauge(), Arc::clone(&recorder), test_config());
        monitor.accepting_flag().store(true, SeqCst);
        validate_pool(&pool).await;
        monitor.evaluate();

        recorder.record_failure();
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Degraded);

        monitor.evaluate(); // clean
        recorder.record_failure();
        monitor.evaluate(); // dirty again, streak resets
        monitor.evaluate(); // clean #1
        assert_eq!(monitor.current(), HealthStatus::Degraded);
        monitor.evaluate(); // clean #2
        assert_eq!(monitor.current(), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pool_past_grace_is_unhealthy() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut monitor = HealthMonitor::new(pool.gauge(), HealthRecorder::new(), test_config());
        monitor.accepting_flag().store(true, SeqCst);

        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Starting, "grace not yet expired");

        tokio::time::advance(Duration::from_secs(31)).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Unhealthy);
        let snapshot = monitor.subscribe().borrow().clone();
        assert!(!snapshot.status.is_ready());
        assert!(snapshot.reason.unwrap().contains("no database connection"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_recovers_when_pool_refills() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut monitor = HealthMonitor::new(pool.gauge(), HealthRecorder::new(), test_config());
        monitor.accepting_flag().store(true, SeqCst);

        tokio::time::advance(Duration::from_secs(31)).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Unhealthy);

        validate_pool(&pool).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_pool_that_empties_goes_unhealthy_after_grace() {
        let connector = MockConnector::new();
        let pool = pool(&connector);
        let mut monitor = HealthMonitor::new(pool.gauge(), HealthRecorder::new(), test_config());
        monitor.accepting_flag().store(true, SeqCst);
        validate_pool(&pool).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy);

        pool.close(Duration::from_millis(50)).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Healthy, "within grace");

        tokio::time::advance(Duration::from_secs(31)).await;
        monitor.evaluate();
        assert_eq!(monitor.current(), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Starting).unwrap(),
            "\"starting\""
        );
    }
}
