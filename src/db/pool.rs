//! Connection pool that lends raw database connections out one lease at a time.
//!
//! Capacity is enforced with a semaphore sized to `max_size`; the idle set and
//! open-connection count live behind a single mutex, touched only by
//! acquire/release and the maintenance task. A lease returns its connection to
//! the idle set on drop unless its validity flag was cleared, in which case
//! the connection is closed and a replacement is opened on demand.
//!
//! Connection strategy:
//! - Connections are created lazily, on acquire or by maintenance top-up
//! - Every new connection is probed before its first lend
//! - Idle connections that sat unused past a threshold are re-probed
//! - Failed connects retry with exponential backoff and jitter, then give up
//!   and let the gauge carry the bad news to the health monitor

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant};
use tracing::instrument;

use crate::config::{
    DatabaseConfig, POOL_BACKOFF_BASE_MS, POOL_BACKOFF_CAP_MS, POOL_BACKOFF_JITTER,
    POOL_CONNECT_ATTEMPTS, POOL_DRAIN_POLL_MS, POOL_MAINTENANCE_INTERVAL_SECS,
    POOL_REVALIDATE_IDLE_SECS,
};

use super::connection::Connector;
use super::DbError;

/// Pool sizing and lifecycle knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum open connections, idle and lent combined
    pub max_size: usize,
    /// Idle connections kept alive past the inactivity threshold
    pub min_idle: usize,
    /// Idle connections unused this long are closed by maintenance
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            min_idle: 1,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn from_database(config: &DatabaseConfig) -> Self {
        Self {
            max_size: config.max_size,
            min_idle: config.min_idle,
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Point-in-time view of the pool, read by the health monitor.
#[derive(Debug, Clone)]
pub struct PoolStatus {
    /// Open connections, idle and lent combined
    pub open: usize,
    /// Connections currently lent out
    pub lent: usize,
    /// Connections sitting in the idle set
    pub idle: usize,
    /// Whether any connection ever passed its probe
    pub ever_validated: bool,
    /// Connect attempts failed since the last success
    pub consecutive_connect_failures: u32,
    /// Last time the pool proved it had a working connection
    pub last_success: Option<Instant>,
}

/// Shared counters the pool keeps truthful for the health monitor.
///
/// Cheap to clone; reading never touches the registry mutex.
#[derive(Clone, Default)]
pub struct PoolGauge {
    inner: Arc<GaugeInner>,
}

#[derive(Default)]
struct GaugeInner {
    open: AtomicUsize,
    lent: AtomicUsize,
    ever_validated: AtomicBool,
    consecutive_connect_failures: AtomicU32,
    last_success: Mutex<Option<Instant>>,
}

impl PoolGauge {
    pub fn status(&self) -> PoolStatus {
        let open = self.inner.open.load(Ordering::SeqCst);
        let lent = self.inner.lent.load(Ordering::SeqCst);
        PoolStatus {
            open,
            lent,
            idle: open.saturating_sub(lent),
            ever_validated: self.inner.ever_validated.load(Ordering::SeqCst),
            consecutive_connect_failures: self
                .inner
                .consecutive_connect_failures
                .load(Ordering::SeqCst),
            last_success: *self.inner.last_success.lock().unwrap(),
        }
    }

    fn record_success(&self) {
        self.inner.ever_validated.store(true, Ordering::SeqCst);
        self.inner
            .consecutive_connect_failures
            .store(0, Ordering::SeqCst);
        *self.inner.last_success.lock().unwrap() = Some(Instant::now());
    }

    fn record_connect_failure(&self) {
        self.inner
            .consecutive_connect_failures
            .fetch_add(1, Ordering::SeqCst);
    }
}

struct IdleConn<C: Connector> {
    conn: C::Conn,
    id: u64,
    since: Instant,
}

struct Registry<C: Connector> {
    idle: Vec<IdleConn<C>>,
    open: usize,
    next_id: u64,
}

struct PoolInner<C: Connector> {
    connector: C,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    registry: Mutex<Registry<C>>,
    gauge: PoolGauge,
    closed: AtomicBool,
}

/// Cheap-to-clone handle to the pool.
pub struct ConnectionPool<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A connection on loan from the pool.
///
/// Dropping the lease releases it: the connection rejoins the idle set if the
/// validity flag is still set, otherwise it is closed and the pool opens a
/// replacement on demand. Capacity is freed either way.
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    id: u64,
    valid: bool,
    pool: ConnectionPool<C>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConn<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the connection unsafe to reuse; it will be discarded on release.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Mark the connection clean again after a completed operation.
    pub fn mark_valid(&mut self) {
        self.valid = true;
    }

    pub fn conn(&mut self) -> &mut C::Conn {
        // Some until drop; the Option exists so Drop can move the connection out
        self.conn.as_mut().unwrap()
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.id, self.valid);
        }
        // the permit drops with the lease, freeing capacity
    }
}

// Manual impl: `C::Conn` is driver state with no Debug of its own.
impl<C: Connector> fmt::Debug for PooledConn<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConn")
            .field("id", &self.id)
            .field("valid", &self.valid)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                connector,
                config,
                semaphore,
                registry: Mutex::new(Registry {
                    idle: Vec::new(),
                    open: 0,
                    next_id: 0,
                }),
                gauge: PoolGauge::default(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Handle for the health monitor; clones share the pool's counters.
    pub fn gauge(&self) -> PoolGauge {
        self.inner.gauge.clone()
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.gauge.status()
    }

    /// Borrow a connection, waiting up to `acquire_timeout` for capacity.
    ///
    /// The timeout bounds only the wait for a free slot; establishing a new
    /// connection has its own bounded backoff schedule and reports
    /// `ConnectionLost` when it gives up.
    pub async fn acquire(&self, acquire_timeout: Duration) -> Result<PooledConn<C>, DbError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Shutdown);
        }

        let permit = match timeout(
            acquire_timeout,
            Arc::clone(&self.inner.semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(DbError::Shutdown),
            Err(_) => return Err(DbError::PoolExhausted),
        };

        // Prefer idle connections, newest first. Stale ones are re-probed and
        // discarded on failure; the loop then falls through to creating one.
        loop {
            let candidate = self.inner.registry.lock().unwrap().idle.pop();
            let Some(mut idle) = candidate else { break };

            if idle.since.elapsed() >= Duration::from_secs(POOL_REVALIDATE_IDLE_SECS) {
                if let Err(e) = self.inner.connector.probe(&mut idle.conn).await {
                    tracing::debug!(conn_id = idle.id, error = %e, "Discarding stale idle connection");
                    self.discard_open(idle.conn).await;
                    continue;
                }
                self.inner.gauge.record_success();
            }

            return Ok(self.lend(idle.conn, idle.id, permit));
        }

        let conn = self.connect_with_retry().await?;
        let id = {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.open += 1;
            registry.next_id += 1;
            registry.next_id
        };
        self.inner.gauge.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(self.lend(conn, id, permit))
    }

    fn lend(&self, conn: C::Conn, id: u64, permit: OwnedSemaphorePermit) -> PooledConn<C> {
        self.inner.gauge.inner.lent.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(conn_id = id, "Connection lent");
        PooledConn {
            conn: Some(conn),
            id,
            valid: true,
            pool: self.clone(),
            _permit: permit,
        }
    }

    /// Release path shared by every lease drop. Runs synchronously so a lease
    /// can be dropped anywhere, including from a cancelled request task.
    fn release(&self, conn: C::Conn, id: u64, valid: bool) {
        if valid && !self.inner.closed.load(Ordering::SeqCst) {
            {
                let mut registry = self.inner.registry.lock().unwrap();
                registry.idle.push(IdleConn {
                    conn,
                    id,
                    since: Instant::now(),
                });
            }
            self.inner.gauge.record_success();
            self.inner.gauge.inner.lent.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(conn_id = id, "Connection returned to idle set");
            return;
        }

        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.open -= 1;
        }
        self.inner.gauge.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.inner.gauge.inner.lent.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(conn_id = id, "Discarding invalidated connection");

        let pool = self.clone();
        // Drop can run after the runtime is gone during teardown; then the
        // socket simply closes with the process.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pool.inner.connector.close(conn).await });
        }
    }

    /// Close an idle/untracked connection and decrement the open count.
    async fn discard_open(&self, conn: C::Conn) {
        {
            let mut registry = self.inner.registry.lock().unwrap();
            registry.open -= 1;
        }
        self.inner.gauge.inner.open.fetch_sub(1, Ordering::SeqCst);
        self.inner.connector.close(conn).await;
    }

    /// Open and probe one connection, retrying with exponential backoff.
    async fn connect_with_retry(&self) -> Result<C::Conn, DbError> {
        let mut delay = Duration::from_millis(POOL_BACKOFF_BASE_MS);
        let mut last_error = String::new();

        for attempt in 1..=POOL_CONNECT_ATTEMPTS {
            match self.connect_once().await {
                Ok(conn) => {
                    self.inner.gauge.record_success();
                    return Ok(conn);
                }
                Err(e) => {
                    self.inner.gauge.record_connect_failure();
                    tracing::warn!(attempt, error = %e, "Database connect failed");
                    last_error = e.to_string();
                    if attempt < POOL_CONNECT_ATTEMPTS {
                        sleep(jittered(delay)).await;
                        delay = (delay * 2).min(Duration::from_millis(POOL_BACKOFF_CAP_MS));
                    }
                }
            }
        }

        tracing::error!(
            attempts = POOL_CONNECT_ATTEMPTS,
            "Giving up connecting to the database"
        );
        Err(DbError::ConnectionLost(last_error))
    }

    async fn connect_once(&self) -> Result<C::Conn, sqlx::Error> {
        let mut conn = self.inner.connector.connect().await?;
        if let Err(e) = self.inner.connector.probe(&mut conn).await {
            self.inner.connector.close(conn).await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Spawn the maintenance task; it stops when `shutdown` fires.
    pub fn spawn_maintenance(&self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(pool.maintain(shutdown))
    }

    #[instrument(name = "db.pool.maintain", skip_all)]
    async fn maintain(self, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Pool maintenance starting");
        let mut ticker = interval(Duration::from_secs(POOL_MAINTENANCE_INTERVAL_SECS));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.maintain_once().await,
                _ = shutdown.changed() => {
                    tracing::debug!("Pool maintenance stopping");
                    break;
                }
            }
        }
    }

    /// One maintenance round: reap expired idle connections beyond `min_idle`,
    /// then top the pool back up toward `min_idle` one connection at a time.
    async fn maintain_once(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }

        let expired = {
            let mut registry = self.inner.registry.lock().unwrap();
            let mut expired = Vec::new();
            while registry.idle.len() > self.inner.config.min_idle
                && registry
                    .idle
                    .first()
                    .is_some_and(|c| c.since.elapsed() >= self.inner.config.idle_timeout)
            {
                expired.push(registry.idle.remove(0));
            }
            registry.open -= expired.len();
            expired
        };
        if !expired.is_empty() {
            self.inner
                .gauge
                .inner
                .open
                .fetch_sub(expired.len(), Ordering::SeqCst);
            tracing::debug!(count = expired.len(), "Closing expired idle connections");
            join_all(
                expired
                    .into_iter()
                    .map(|idle| self.inner.connector.close(idle.conn)),
            )
            .await;
        }

        let status = self.status();
        if status.idle < self.inner.config.min_idle && status.open < self.inner.config.max_size {
            // Hold a capacity slot while opening, exactly as a lease would;
            // a top-up racing real acquires must not push the pool past
            // max_size. No free slot means the pool is busy, not cold.
            let Ok(_permit) = Arc::clone(&self.inner.semaphore).try_acquire_owned() else {
                return;
            };
            match self.connect_with_retry().await {
                Ok(conn) => {
                    let mut registry = self.inner.registry.lock().unwrap();
                    registry.open += 1;
                    registry.next_id += 1;
                    let id = registry.next_id;
                    registry.idle.push(IdleConn {
                        conn,
                        id,
                        since: Instant::now(),
                    });
                    drop(registry);
                    self.inner.gauge.inner.open.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(conn_id = id, "Warmed idle connection");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Pool warm-up failed");
                }
            }
        }
    }

    /// Stop lending, wait up to `drain_timeout` for lent connections to come
    /// home, then close everything that is left.
    #[instrument(name = "db.pool.close", skip(self))]
    pub async fn close(&self, drain_timeout: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        let drained = timeout(drain_timeout, async {
            while self.status().lent > 0 {
                sleep(Duration::from_millis(POOL_DRAIN_POLL_MS)).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            tracing::warn!(
                lent = self.status().lent,
                "Closing pool with connections still lent out"
            );
        }

        let idle = {
            let mut registry = self.inner.registry.lock().unwrap();
            let idle = std::mem::take(&mut registry.idle);
            registry.open -= idle.len();
            idle
        };
        self.inner
            .gauge
            .inner
            .open
            .fetch_sub(idle.len(), Ordering::SeqCst);
        join_all(
            idle.into_iter()
                .map(|idle| self.inner.connector.close(idle.conn)),
        )
        .await;
        tracing::info!("Connection pool closed");
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = 1.0 + POOL_BACKOFF_JITTER * (fastrand::f64() * 2.0 - 1.0);
    delay.mul_f64(factor)
}
