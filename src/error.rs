//! Error types for db-txscope.
//!
//! All database-facing operations return [`DbResult`]. The transaction
//! coordinator adds conditions of its own: [`DbError::TxDone`] for a commit
//! or rollback against a finished transaction, [`DbError::Finalize`] when
//! finalization fails while handling cancellation, and [`DbError::Rollback`]
//! when the rollback after a failed unit of work fails too.

use crate::context::ContextError;
use thiserror::Error;

/// Boxed error carried as the cause of a failed finalization.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "23505" for unique violation
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("No rows returned")]
    NoRows,

    /// Commit or rollback issued against a transaction that has already
    /// been committed or rolled back.
    #[error("Transaction has already been committed or rolled back")]
    TxDone,

    #[error(transparent)]
    Context(#[from] ContextError),

    /// Commit or rollback failed while handling `cause`.
    #[error("{source}: {cause}")]
    Finalize {
        cause: BoxError,
        source: Box<DbError>,
    },

    /// Rollback failed after the unit of work returned `cause`.
    #[error("{cause}: {source}")]
    Rollback {
        cause: BoxError,
        source: Box<DbError>,
    },

    #[error("Timeout: {operation}")]
    Timeout { operation: String },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Combine a finalization failure with the condition that triggered it.
    pub fn finalize(cause: impl Into<BoxError>, source: DbError) -> Self {
        Self::Finalize {
            cause: cause.into(),
            source: Box::new(source),
        }
    }

    /// Combine a failed rollback with the error the unit of work returned.
    pub fn rollback(cause: impl Into<BoxError>, source: DbError) -> Self {
        Self::Rollback {
            cause: cause.into(),
            source: Box::new(source),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the already-finalized condition.
    pub fn is_tx_done(&self) -> bool {
        matches!(self, Self::TxDone)
    }

    /// The cancellation condition carried by this error, if any.
    ///
    /// Looks through [`DbError::Finalize`] and [`DbError::Rollback`] causes,
    /// so a rollback failure combined with an expired deadline still reports
    /// `DeadlineExceeded`.
    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            Self::Context(err) => Some(*err),
            Self::Finalize { cause, .. } | Self::Rollback { cause, .. } => {
                if let Some(err) = cause.downcast_ref::<ContextError>() {
                    Some(*err)
                } else {
                    cause
                        .downcast_ref::<DbError>()
                        .and_then(DbError::context_error)
                }
            }
            _ => None,
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::NoRows,
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection pool acquire exceeded acquire_timeout")
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::internal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::internal("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::connection("Failed to connect", "Check credentials");
        assert!(err.to_string().contains("Connection failed"));
    }

    #[test]
    fn test_error_suggestion() {
        let err = DbError::database(
            "UNIQUE constraint failed",
            Some("2067".to_string()),
            "Check the SQL syntax and referenced objects",
        );
        assert_eq!(
            err.suggestion(),
            Some("Check the SQL syntax and referenced objects")
        );
        assert_eq!(DbError::TxDone.suggestion(), None);
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(DbError::connection("err", "sugg").is_retryable());
        assert!(!DbError::TxDone.is_retryable());
    }

    #[test]
    fn test_pool_timeout_does_not_claim_a_duration() {
        let err = DbError::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DbError::Timeout { .. }));
        assert_eq!(
            err.to_string(),
            "Timeout: connection pool acquire exceeded acquire_timeout"
        );
    }

    #[test]
    fn test_rollback_message_puts_work_error_first() {
        let err = DbError::rollback(
            DbError::NoRows,
            DbError::connection("broken pipe", "reconnect"),
        );
        assert_eq!(
            err.to_string(),
            "No rows returned: Connection failed: broken pipe"
        );
        assert_eq!(err.context_error(), None);

        let err = DbError::rollback(
            DbError::Context(ContextError::Canceled),
            DbError::connection("broken pipe", "reconnect"),
        );
        assert_eq!(err.context_error(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_row_not_found_maps_to_no_rows() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DbError::NoRows));
    }

    #[test]
    fn test_pool_closed_maps_to_connection() {
        let err: DbError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[test]
    fn test_finalize_message_puts_finalize_error_first() {
        let err = DbError::finalize(
            ContextError::DeadlineExceeded,
            DbError::connection("broken pipe", "reconnect"),
        );
        assert_eq!(
            err.to_string(),
            "Connection failed: broken pipe: context deadline exceeded"
        );
    }

    #[test]
    fn test_context_error_found_through_finalize() {
        let err = DbError::finalize(
            ContextError::Canceled,
            DbError::connection("broken pipe", "reconnect"),
        );
        assert_eq!(err.context_error(), Some(ContextError::Canceled));

        let nested = DbError::finalize(
            DbError::Context(ContextError::DeadlineExceeded),
            DbError::internal("rollback failed"),
        );
        assert_eq!(nested.context_error(), Some(ContextError::DeadlineExceeded));

        assert_eq!(DbError::TxDone.context_error(), None);
    }

    #[test]
    fn test_is_tx_done() {
        assert!(DbError::TxDone.is_tx_done());
        assert!(!DbError::NoRows.is_tx_done());
    }
}
