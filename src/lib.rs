//! db-txscope library.
//!
//! Context-scoped transactions over pooled SQL connections (SQLite,
//! PostgreSQL, MySQL). A [`Context`] carries cancellation, a deadline, and
//! optionally an active transaction; [`Database`] routes each statement to
//! that transaction or to the pool, and [`Database::run`] wraps a unit of
//! work in a transaction that commits, rolls back, or unwinds with it.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod models;

pub use config::Config;
pub use context::{CancelHandle, Context, ContextError};
pub use db::{Database, Transaction};
pub use error::{DbError, DbResult};
pub use models::{ExecResult, JsonRow, QueryParam};
