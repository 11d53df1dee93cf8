//! Single entry point for running database operations.
//!
//! Every statement the service issues goes through [`Gateway::execute`], which
//! owns the lease lifecycle: acquire, run under the query deadline, release.
//! Callers never see a connection handle, so a connection cannot leak past an
//! early return or a cancelled request.
//!
//! Leases are handled pessimistically. The gateway invalidates a lease before
//! the operation starts and re-validates it only after the operation finished
//! cleanly; if the caller's future is dropped mid-operation, the lease drops in
//! its invalid state and the pool discards the connection instead of re-idling
//! one with a half-written protocol exchange on it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::instrument;

use crate::config::DatabaseConfig;
use crate::db::{ConnectionPool, Connector, DbError};
use crate::health::HealthRecorder;

pub struct Gateway<C: Connector> {
    pool: ConnectionPool<C>,
    recorder: Arc<HealthRecorder>,
    acquire_timeout: Duration,
    query_timeout: Duration,
}

impl<C: Connector> Clone for Gateway<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            recorder: Arc::clone(&self.recorder),
            acquire_timeout: self.acquire_timeout,
            query_timeout: self.query_timeout,
        }
    }
}

impl<C: Connector> Gateway<C> {
    pub fn new(
        pool: ConnectionPool<C>,
        recorder: Arc<HealthRecorder>,
        config: &DatabaseConfig,
    ) -> Self {
        Self {
            pool,
            recorder,
            acquire_timeout: config.acquire_timeout(),
            query_timeout: config.query_timeout(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<C> {
        &self.pool
    }

    /// Run `op` on a pooled connection.
    ///
    /// `op` may be invoked twice: when the connection turns out to be dead
    /// mid-operation, the broken connection is discarded and the operation is
    /// retried once on a fresh one. A second loss, and every other error, is
    /// returned to the caller. Rejections from the database (`DbError::Query`)
    /// are never retried; the statement would just be rejected again.
    #[instrument(name = "db.execute", skip(self, op))]
    pub async fn execute<T, F>(&self, operation: &'static str, op: F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut C::Conn) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let mut result = self.attempt(operation, &op).await;
        if let Err(err) = &result {
            if err.is_connection_lost() {
                tracing::debug!(
                    operation,
                    error = %err,
                    "Connection lost mid-operation, retrying on a fresh connection"
                );
                result = self.attempt(operation, &op).await;
            }
        }
        self.record_outcome(operation, result.as_ref().err());
        result
    }

    async fn attempt<T, F>(&self, operation: &'static str, op: &F) -> Result<T, DbError>
    where
        T: Send,
        F: for<'c> Fn(&'c mut C::Conn) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let mut lease = self.pool.acquire(self.acquire_timeout).await?;
        // Tainted while the operation is in flight: if this future is dropped
        // before the match below runs, the lease must not go back to idle.
        lease.invalidate();

        match tokio::time::timeout(self.query_timeout, op(lease.conn())).await {
            Ok(Ok(value)) => {
                lease.mark_valid();
                Ok(value)
            }
            Ok(Err(err)) => {
                let classified = DbError::classify(err, operation);
                if !classified.is_connection_lost() {
                    // The connection answered; only its answer was bad.
                    lease.mark_valid();
                }
                Err(classified)
            }
            // Deadline hit with the exchange half-done; the lease stays
            // invalid and the pool discards the connection.
            Err(_) => Err(DbError::QueryTimeout { operation }),
        }
    }

    /// Feed the health monitor. A rejection from a live database counts as a
    /// success; capacity errors say nothing about the database and count as
    /// neither.
    fn record_outcome(&self, operation: &'static str, err: Option<&DbError>) {
        match err {
            None => self.recorder.record_success(),
            Some(err) if err.is_infra_failure() => {
                tracing::warn!(operation, error = %err, "Database operation failed");
                self.recorder.record_failure();
            }
            Some(DbError::Query { .. }) => self.recorder.record_success(),
            Some(err) => {
                tracing::warn!(operation, error = %err, "Database operation rejected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{FakeDbError, FakeKind, MockConnector};
    use crate::db::{PoolConfig, QueryErrorKind};
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    fn test_gateway(
        connector: &Arc<MockConnector>,
        max_size: usize,
    ) -> Gateway<Arc<MockConnector>> {
        let pool = ConnectionPool::new(
            Arc::clone(connector),
            PoolConfig {
                max_size,
                min_idle: 0,
                idle_timeout: Duration::from_secs(300),
            },
        );
        let config = DatabaseConfig {
            acquire_timeout_seconds: 1,
            query_timeout_seconds: 2,
            ..DatabaseConfig::default()
        };
        Gateway::new(pool, HealthRecorder::new(), &config)
    }

    /// Spawned discards need a few polls to run.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn io_error() -> sqlx::Error {
        sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "connection reset mid-query",
        ))
    }

    #[tokio::test]
    async fn test_successful_operation_returns_connection_to_idle() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);

        let result = gateway
            .execute("fetch", |conn| {
                let id = conn.id;
                Box::pin(async move { Ok(id) })
            })
            .await;

        assert_eq!(result.unwrap(), 0);
        let status = gateway.pool().status();
        assert_eq!(status.lent, 0);
        assert_eq!(status.idle, 1);
        assert_eq!(gateway.recorder.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_sequential_operations_reuse_one_connection() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);

        for _ in 0..1000 {
            let result = gateway
                .execute("fetch", |conn| {
                    let id = conn.id;
                    Box::pin(async move { Ok(id) })
                })
                .await;
            assert_eq!(result.unwrap(), 0);
        }

        let status = gateway.pool().status();
        assert_eq!(status.lent, 0);
        assert_eq!(status.idle, 1, "sequential load reuses a single connection");
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn test_connection_lost_retries_once_on_a_fresh_connection() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);
        let failures = AtomicUsize::new(1);

        let result = gateway
            .execute("fetch", |conn| {
                let fail = failures
                    .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let id = conn.id;
                Box::pin(async move {
                    if fail {
                        Err(io_error())
                    } else {
                        Ok(id)
                    }
                })
            })
            .await;

        // The retry ran on a replacement connection, not the broken one.
        assert_eq!(result.unwrap(), 1);
        assert_eq!(connector.attempts(), 2);
        settle().await;
        assert_eq!(connector.closed.load(SeqCst), 1);
        assert_eq!(gateway.pool().status().idle, 1);
        assert_eq!(gateway.recorder.counts(), (1, 0));
    }

    #[tokio::test]
    async fn test_second_connection_loss_is_returned_to_the_caller() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);
        let invocations = AtomicUsize::new(0);

        let result: Result<(), _> = gateway
            .execute("fetch", |_conn| {
                invocations.fetch_add(1, SeqCst);
                Box::pin(async move { Err(io_error()) })
            })
            .await;

        assert!(result.unwrap_err().is_connection_lost());
        assert_eq!(invocations.load(SeqCst), 2, "one retry, never a third");
        settle().await;
        assert_eq!(connector.closed.load(SeqCst), 2);
        assert_eq!(gateway.recorder.counts(), (0, 1));
    }

    #[tokio::test]
    async fn test_rejected_statement_is_not_retried_and_keeps_the_connection() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);
        let invocations = AtomicUsize::new(0);

        let result: Result<(), _> = gateway
            .execute("insert_visit", |_conn| {
                invocations.fetch_add(1, SeqCst);
                Box::pin(async move {
                    Err(sqlx::Error::Database(FakeDbError::boxed(
                        "duplicate key value violates unique constraint",
                        FakeKind::Unique,
                        Some("23505"),
                    )))
                })
            })
            .await;

        match result.unwrap_err() {
            DbError::Query { kind, .. } => assert_eq!(kind, QueryErrorKind::Constraint),
            other => panic!("expected Query, got {other:?}"),
        }
        assert_eq!(invocations.load(SeqCst), 1);
        // The connection answered and goes back to idle.
        assert_eq!(gateway.pool().status().idle, 1);
        assert_eq!(connector.closed.load(SeqCst), 0);
        // A rejection proves the database is alive.
        assert_eq!(gateway.recorder.counts(), (1, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_discards_the_connection() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);

        let result = gateway
            .execute("slow_query", |_conn| {
                Box::pin(std::future::pending::<Result<u64, sqlx::Error>>())
            })
            .await;

        match result.unwrap_err() {
            DbError::QueryTimeout { operation } => assert_eq!(operation, "slow_query"),
            other => panic!("expected QueryTimeout, got {other:?}"),
        }
        settle().await;
        // Protocol state unknown, so the connection must not be reused.
        assert_eq!(connector.closed.load(SeqCst), 1);
        assert_eq!(gateway.pool().status().idle, 0);
        assert_eq!(gateway.recorder.counts(), (0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_discards_the_connection() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);

        // Drop the whole call mid-operation, as an aborted request does;
        // well before the query deadline so only cancellation is in play.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            gateway.execute("slow_query", |_conn| {
                Box::pin(std::future::pending::<Result<u64, sqlx::Error>>())
            }),
        )
        .await;

        assert!(cancelled.is_err());
        settle().await;
        let status = gateway.pool().status();
        assert_eq!(status.lent, 0);
        assert_eq!(status.idle, 0, "a lease dropped mid-operation never re-idles");
        assert_eq!(status.open, 0);
        assert_eq!(connector.closed.load(SeqCst), 1);
        // Nothing completed, so the health monitor heard nothing.
        assert_eq!(gateway.recorder.counts(), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_counts_as_neither_success_nor_failure() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 1);

        let held = gateway.pool().acquire(Duration::from_millis(100)).await.unwrap();
        let result: Result<(), _> = gateway
            .execute("fetch", |_conn| Box::pin(async move { Ok(()) }))
            .await;

        assert!(matches!(result.unwrap_err(), DbError::PoolExhausted));
        assert_eq!(gateway.recorder.counts(), (0, 0));
        drop(held);
    }

    #[tokio::test]
    async fn test_row_not_found_releases_and_surfaces_as_query_error() {
        let connector = MockConnector::new();
        let gateway = test_gateway(&connector, 2);

        let result: Result<(), _> = gateway
            .execute("stats", |_conn| {
                Box::pin(async move { Err(sqlx::Error::RowNotFound) })
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            DbError::Query {
                kind: QueryErrorKind::Other,
                ..
            }
        ));
        assert_eq!(gateway.pool().status().idle, 1);
    }
}
