//! Data models for db-txscope.

pub mod connection;
pub mod query;

pub use connection::{ConnectionConfig, ConnectionConfigError, DatabaseType, TransactionState};
pub use query::{ExecResult, JsonRow, QueryParam};
