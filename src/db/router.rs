//! Statement routing.
//!
//! Every statement entry point takes the caller's [`Context`]. If the context
//! carries an active transaction the statement runs on that transaction's
//! connection; otherwise it runs on the pool in autocommit mode. The choice is
//! a field read and never fails on its own.

use crate::context::Context;
use crate::db::macros::dispatch;
use crate::db::pool::{Database, DbPool};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{ExecResult, JsonRow, QueryParam};
use std::future::Future;
use tracing::debug;

impl Database {
    /// Run a statement that returns rows.
    pub async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<JsonRow>> {
        require_statement(sql)?;
        if let Some(tx) = ctx.transaction() {
            return with_context(ctx, tx.query(sql, params)).await;
        }

        let rows = with_context(ctx, async {
            dispatch!(self.pool(), DbPool, |pool, bind| {
                let rows = bind(sqlx::query(sql), params).fetch_all(pool).await?;
                Ok(rows.iter().map(RowToJson::to_json_map).collect::<Vec<_>>())
            })
        })
        .await?;

        debug!(
            connection_id = %self.id(),
            sql = %sql,
            row_count = rows.len(),
            "Queried"
        );
        Ok(rows)
    }

    /// Run a statement expected to return at most one row.
    ///
    /// Returns [`DbError::NoRows`] when it returns none; extra rows are ignored.
    pub async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<JsonRow> {
        require_statement(sql)?;
        if let Some(tx) = ctx.transaction() {
            return with_context(ctx, tx.query_row(sql, params)).await;
        }

        with_context(ctx, async {
            dispatch!(self.pool(), DbPool, |pool, bind| {
                bind(sqlx::query(sql), params)
                    .fetch_optional(pool)
                    .await?
                    .map(|row| row.to_json_map())
                    .ok_or(DbError::NoRows)
            })
        })
        .await
    }

    /// Run a statement that returns no rows.
    pub async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult> {
        require_statement(sql)?;
        if let Some(tx) = ctx.transaction() {
            return with_context(ctx, tx.exec(sql, params)).await;
        }

        let res = with_context(ctx, async {
            dispatch!(self.pool(), DbPool, |pool, bind| {
                let res = bind(sqlx::query(sql), params).execute(pool).await?;
                Ok(ExecResult::from(res))
            })
        })
        .await?;

        debug!(
            connection_id = %self.id(),
            sql = %sql,
            rows_affected = res.rows_affected,
            "Executed"
        );
        Ok(res)
    }
}

fn require_statement(sql: &str) -> DbResult<()> {
    if sql.trim().is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }
    Ok(())
}

/// Await `op`, abandoning it if `ctx` is done first.
pub(crate) async fn with_context<T>(
    ctx: &Context,
    op: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    if let Some(err) = ctx.err() {
        return Err(err.into());
    }
    tokio::select! {
        biased;
        err = ctx.cancelled() => Err(err.into()),
        result = op => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextError;
    use std::time::Duration;

    #[tokio::test]
    async fn test_with_context_rejects_done_context() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        let err = with_context(&ctx, async { Ok(1) }).await.unwrap_err();
        assert_eq!(err.context_error(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn test_with_context_abandons_slow_operation() {
        let (ctx, _cancel) = Context::background().with_timeout(Duration::from_millis(20));
        let err = with_context(&ctx, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert_eq!(err.context_error(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_require_statement() {
        assert!(require_statement("SELECT 1").is_ok());
        for sql in ["", "   ", "\n\t"] {
            let err = require_statement(sql).unwrap_err();
            assert!(matches!(err, DbError::InvalidInput { .. }));
        }
    }

    #[tokio::test]
    async fn test_with_context_passes_through_result() {
        let ctx = Context::background();
        let value = with_context(&ctx, async { Ok::<_, DbError>(42) })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let err = with_context(&ctx, async { Err::<(), _>(DbError::NoRows) })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NoRows));
    }
}
