//! Database access layer.
//!
//! Connections are raw `sqlx` PostgreSQL connections owned by an in-crate
//! pool; nothing here uses driver-level pooling. The [`pool`] module lends
//! connections out one lease at a time, the [`gateway`] module runs operations
//! on leased connections and classifies every failure into [`DbError`], and
//! [`connection`] holds the driver seam the pool is generic over.

pub mod connection;
pub mod gateway;
pub mod pool;

pub use connection::{Connector, PgConnector};
pub use gateway::Gateway;
pub use pool::{ConnectionPool, PoolConfig, PoolGauge, PoolStatus, PooledConn};

/// How the database rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Unique, foreign key, not-null, or check violation (SQLSTATE class 23)
    Constraint,
    /// The statement was valid but the data was not (SQLSTATE class 22)
    InvalidData,
    /// Anything else the database reported; surfaced as an internal fault
    Other,
}

/// Errors produced by the pool and gateway.
///
/// The split matters to callers: `ConnectionLost` and `QueryTimeout` say the
/// infrastructure misbehaved (the gateway reports them to the health monitor),
/// while `Query` says the caller's statement or data was rejected and retrying
/// would not help.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// No connection became free within the acquire timeout
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Transport or protocol failure; the affected connection is discarded
    #[error("Database connection lost: {0}")]
    ConnectionLost(String),

    /// The operation exceeded its deadline; the connection is discarded
    /// because its protocol state is unknown
    #[error("Query timed out during {operation}")]
    QueryTimeout { operation: &'static str },

    /// The database rejected the statement or its data
    #[error("Query failed: {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
    },

    /// The pool is closed; the service is shutting down
    #[error("Service is shutting down")]
    Shutdown,
}

impl DbError {
    /// Failures that count toward the degraded threshold: the database did
    /// not answer, as opposed to answering with a rejection.
    pub fn is_infra_failure(&self) -> bool {
        matches!(
            self,
            DbError::ConnectionLost(_) | DbError::QueryTimeout { .. }
        )
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, DbError::ConnectionLost(_))
    }

    /// Map a driver error onto the taxonomy. `operation` names the gateway
    /// call for log context.
    pub(crate) fn classify(err: sqlx::Error, operation: &'static str) -> Self {
        use sqlx::error::ErrorKind;

        match err {
            sqlx::Error::Database(db) => {
                let kind = match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => QueryErrorKind::Constraint,
                    _ => match db.code().as_deref() {
                        Some(code) if code.starts_with("23") => QueryErrorKind::Constraint,
                        Some(code) if code.starts_with("22") => QueryErrorKind::InvalidData,
                        _ => QueryErrorKind::Other,
                    },
                };
                DbError::Query {
                    kind,
                    message: db.message().to_string(),
                }
            }
            sqlx::Error::Io(e) => DbError::ConnectionLost(format!("{operation}: {e}")),
            sqlx::Error::Tls(e) => DbError::ConnectionLost(format!("{operation}: {e}")),
            sqlx::Error::Protocol(e) => DbError::ConnectionLost(format!("{operation}: {e}")),
            sqlx::Error::WorkerCrashed => {
                DbError::ConnectionLost(format!("{operation}: connection worker crashed"))
            }
            other => DbError::Query {
                kind: QueryErrorKind::Other,
                message: format!("{operation}: {other}"),
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{FakeDbError, FakeKind};
    use super::*;

    #[test]
    fn test_classify_io_error_is_connection_lost() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        let classified = DbError::classify(err, "insert_visit");
        assert!(classified.is_connection_lost());
        assert!(classified.is_infra_failure());
    }

    #[test]
    fn test_classify_unique_violation_is_constraint() {
        let err = sqlx::Error::Database(FakeDbError::boxed(
            "duplicate key value violates unique constraint",
            FakeKind::Unique,
            Some("23505"),
        ));
        match DbError::classify(err, "insert_visit") {
            DbError::Query { kind, .. } => assert_eq!(kind, QueryErrorKind::Constraint),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_check_violation_is_constraint() {
        // No SQLSTATE code here, so the driver-reported kind alone decides
        let err = sqlx::Error::Database(FakeDbError::boxed(
            "new row violates check constraint \"visits_event_check\"",
            FakeKind::Check,
            None,
        ));
        match DbError::classify(err, "insert_visit") {
            DbError::Query { kind, .. } => assert_eq!(kind, QueryErrorKind::Constraint),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_sqlstate_22_is_invalid_data() {
        let err = sqlx::Error::Database(FakeDbError::boxed(
            "invalid input syntax for type bigint",
            FakeKind::Other,
            Some("22P02"),
        ));
        match DbError::classify(err, "insert_visit") {
            DbError::Query { kind, .. } => assert_eq!(kind, QueryErrorKind::InvalidData),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_unknown_database_error_is_other() {
        let err = sqlx::Error::Database(FakeDbError::boxed(
            "relation \"visits\" does not exist",
            FakeKind::Other,
            Some("42P01"),
        ));
        match DbError::classify(err, "stats") {
            DbError::Query { kind, .. } => assert_eq!(kind, QueryErrorKind::Other),
            other => panic!("expected Query, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_row_not_found_is_not_infra() {
        let classified = DbError::classify(sqlx::Error::RowNotFound, "stats");
        assert!(!classified.is_infra_failure());
    }

    #[test]
    fn test_query_error_is_never_retried_class() {
        let err = DbError::Query {
            kind: QueryErrorKind::Constraint,
            message: "duplicate".into(),
        };
        assert!(!err.is_connection_lost());
        assert!(!err.is_infra_failure());
    }
}
