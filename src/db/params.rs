//! Parameter binding for positional statement arguments.
//!
//! The three backends accept the same Rust types, so one macro generates a
//! binder per argument buffer type.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! binder {
    ($(#[$doc:meta])* $name:ident, $db:ty, $lt:lifetime, $args:ty) => {
        $(#[$doc])*
        pub(crate) fn $name<$lt>(
            mut query: Query<$lt, $db, $args>,
            params: &$lt [QueryParam],
        ) -> Query<$lt, $db, $args> {
            for param in params {
                query = match param {
                    QueryParam::Null => query.bind(None::<String>),
                    QueryParam::Bool(v) => query.bind(*v),
                    QueryParam::Int(v) => query.bind(*v),
                    QueryParam::Float(v) => query.bind(*v),
                    QueryParam::String(v) => query.bind(v.as_str()),
                    QueryParam::Bytes(v) => query.bind(v.as_slice()),
                };
            }
            query
        }
    };
}

binder!(
    /// Bind all parameters to a MySQL query.
    bind_mysql_params, MySql, 'q, MySqlArguments
);
binder!(
    /// Bind all parameters to a PostgreSQL query.
    bind_postgres_params, Postgres, 'q, PgArguments
);
binder!(
    /// Bind all parameters to a SQLite query.
    bind_sqlite_params, Sqlite, 'q, SqliteArguments<'q>
);
