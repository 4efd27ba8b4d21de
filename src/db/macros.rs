//! Backend dispatch macro.
//!
//! `DbPool` and `DbTransaction` both wrap one value per backend. Statement
//! code is identical across backends except for the concrete types, so the
//! body is written once and expanded into every match arm.

/// Expand `$body` once per backend variant of `$ty`.
///
/// `$inner` binds the wrapped pool or transaction and `$bind` the matching
/// parameter binder from [`crate::db::params`].
///
/// ```ignore
/// dispatch!(pool, DbPool, |p, bind| {
///     bind(sqlx::query(sql), params).execute(p).await.map(ExecResult::from)
/// })
/// ```
macro_rules! dispatch {
    ($value:expr, $ty:ident, |$inner:ident, $bind:ident| $body:expr) => {
        match $value {
            $ty::MySql($inner) => {
                let $bind = $crate::db::params::bind_mysql_params;
                $body
            }
            $ty::Postgres($inner) => {
                let $bind = $crate::db::params::bind_postgres_params;
                $body
            }
            $ty::SQLite($inner) => {
                let $bind = $crate::db::params::bind_sqlite_params;
                $body
            }
        }
    };
}

pub(crate) use dispatch;
