//! Statement arguments and results.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A result row keyed by column name.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A positional statement argument.
///
/// Built from Rust values through the `From` impls.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    Null,
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    Float(f64),
    String(String),
    /// Bound as a BLOB / BYTEA / VARBINARY value
    Bytes(Vec<u8>),
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Row id generated by the statement, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}

impl From<sqlx::mysql::MySqlQueryResult> for ExecResult {
    fn from(res: sqlx::mysql::MySqlQueryResult) -> Self {
        let id = res.last_insert_id();
        Self {
            rows_affected: res.rows_affected(),
            last_insert_id: (id != 0).then(|| i64::try_from(id).ok()).flatten(),
        }
    }
}

impl From<sqlx::postgres::PgQueryResult> for ExecResult {
    fn from(res: sqlx::postgres::PgQueryResult) -> Self {
        Self {
            rows_affected: res.rows_affected(),
            last_insert_id: None,
        }
    }
}

impl From<sqlx::sqlite::SqliteQueryResult> for ExecResult {
    fn from(res: sqlx::sqlite::SqliteQueryResult) -> Self {
        Self {
            rows_affected: res.rows_affected(),
            last_insert_id: Some(res.last_insert_rowid()),
        }
    }
}
