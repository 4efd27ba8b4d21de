//! Database access layer.
//!
//! - Connection pools, one per backend
//! - Transactions shared across derived contexts
//! - Context-aware statement routing
//! - The transaction coordinator ([`Database::run`])
//! - Row decoding and parameter binding

pub mod coordinator;
pub(crate) mod macros;
pub(crate) mod params;
pub mod pool;
pub mod router;
pub mod transaction;
pub mod types;

pub use pool::{Database, DbPool};
pub use transaction::{DbTransaction, Transaction};
