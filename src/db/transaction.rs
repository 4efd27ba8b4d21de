//! In-flight database transactions.
//!
//! A [`Transaction`] owns one pooled connection from begin until it is
//! committed or rolled back. It is shared as `Arc<Transaction>` between the
//! coordinator and the contexts it publishes, so finalization goes through
//! `&self`: the connection sits in an async mutex and is taken out exactly
//! once. A second commit or rollback finds the slot empty and reports
//! [`DbError::TxDone`].
//!
//! Statements are serialized on the connection in the order they acquire the
//! mutex. `rollback` first trips an abort token: a statement still waiting on
//! the driver is dropped and returns `TxDone`, and so does any statement
//! issued afterwards. Dropping the future does not always stop the statement
//! in the database. SQLite runs it to completion on its worker thread and the
//! `ROLLBACK` waits behind it, so `rollback` can take as long as that
//! statement.

use crate::db::macros::dispatch;
use crate::db::pool::DbPool;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ExecResult, JsonRow, QueryParam, TransactionState};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use sqlx::{MySql, Postgres, Sqlite};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Database-specific transaction wrapper.
pub enum DbTransaction {
    MySql(sqlx::Transaction<'static, MySql>),
    Postgres(sqlx::Transaction<'static, Postgres>),
    SQLite(sqlx::Transaction<'static, Sqlite>),
}

impl DbTransaction {
    /// Begin a transaction at the database's default isolation level.
    pub async fn begin(pool: &DbPool) -> DbResult<Self> {
        Ok(match pool {
            DbPool::MySql(pool) => Self::MySql(pool.begin().await?),
            DbPool::Postgres(pool) => Self::Postgres(pool.begin().await?),
            DbPool::SQLite(pool) => Self::SQLite(pool.begin().await?),
        })
    }

    pub fn db_type(&self) -> DatabaseType {
        match self {
            DbTransaction::MySql(_) => DatabaseType::MySQL,
            DbTransaction::Postgres(_) => DatabaseType::PostgreSQL,
            DbTransaction::SQLite(_) => DatabaseType::SQLite,
        }
    }

    pub async fn commit(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.commit().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.commit().await.map_err(DbError::from),
        }
    }

    pub async fn rollback(self) -> DbResult<()> {
        match self {
            DbTransaction::MySql(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::Postgres(tx) => tx.rollback().await.map_err(DbError::from),
            DbTransaction::SQLite(tx) => tx.rollback().await.map_err(DbError::from),
        }
    }

    async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        dispatch!(self, DbTransaction, |tx, bind| {
            let rows: Vec<_> = bind(sqlx::query(sql), params)
                .fetch(&mut **tx)
                .try_collect()
                .await?;
            Ok(rows.iter().map(RowToJson::to_json_map).collect())
        })
    }

    async fn query_row(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<JsonRow> {
        dispatch!(self, DbTransaction, |tx, bind| {
            bind(sqlx::query(sql), params)
                .fetch_optional(&mut **tx)
                .await?
                .map(|row| row.to_json_map())
                .ok_or(DbError::NoRows)
        })
    }

    async fn exec(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        dispatch!(self, DbTransaction, |tx, bind| {
            let res = bind(sqlx::query(sql), params).execute(&mut **tx).await?;
            Ok(ExecResult::from(res))
        })
    }
}

/// A transaction shared by every context derived from the one that began it.
pub struct Transaction {
    id: String,
    db_type: DatabaseType,
    started_at: DateTime<Utc>,
    conn: Mutex<Option<DbTransaction>>,
    state: AtomicU8,
    abort: CancellationToken,
}

impl Transaction {
    /// Begin a new transaction on `pool` at the default isolation level.
    pub async fn begin(pool: &DbPool) -> DbResult<Self> {
        let tx = DbTransaction::begin(pool).await?;
        let id = generate_transaction_id();
        debug!(transaction_id = %id, db_type = %tx.db_type(), "Transaction started");
        Ok(Self {
            id,
            db_type: tx.db_type(),
            started_at: Utc::now(),
            conn: Mutex::new(Some(tx)),
            state: AtomicU8::new(TransactionState::Active as u8),
            abort: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn db_type(&self) -> DatabaseType {
        self.db_type
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_finalized(&self) -> bool {
        self.state().is_ended()
    }

    /// Commit. Returns [`DbError::TxDone`] if already finalized.
    ///
    /// A failed commit still ends the transaction; the driver rolls it back
    /// when the connection is returned.
    pub async fn commit(&self) -> DbResult<()> {
        let tx = self.conn.lock().await.take().ok_or(DbError::TxDone)?;
        let result = tx.commit().await;
        self.finish(if result.is_ok() {
            TransactionState::Committed
        } else {
            TransactionState::RolledBack
        });
        if let Err(e) = &result {
            warn!(transaction_id = %self.id, error = %e, "Commit failed");
        }
        result
    }

    /// Roll back. Returns [`DbError::TxDone`] if already finalized.
    pub async fn rollback(&self) -> DbResult<()> {
        self.abort.cancel();
        let tx = self.conn.lock().await.take().ok_or(DbError::TxDone)?;
        let result = tx.rollback().await;
        self.finish(TransactionState::RolledBack);
        result
    }

    fn finish(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::Release);
        self.abort.cancel();
        debug!(
            transaction_id = %self.id,
            state = %state,
            elapsed_ms = Utc::now()
                .signed_duration_since(self.started_at)
                .num_milliseconds(),
            "Transaction finished"
        );
    }

    /// Await `op` unless the transaction is aborted first.
    async fn guarded<T>(&self, op: impl Future<Output = DbResult<T>>) -> DbResult<T> {
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => Err(DbError::TxDone),
            result = op => result,
        }
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<Vec<JsonRow>> {
        let rows = self
            .guarded(async {
                let mut conn = self.conn.lock().await;
                conn.as_mut()
                    .ok_or(DbError::TxDone)?
                    .query(sql, params)
                    .await
            })
            .await?;
        debug!(
            transaction_id = %self.id,
            sql = %sql,
            row_count = rows.len(),
            "Queried in transaction"
        );
        Ok(rows)
    }

    pub async fn query_row(&self, sql: &str, params: &[QueryParam]) -> DbResult<JsonRow> {
        self.guarded(async {
            let mut conn = self.conn.lock().await;
            conn.as_mut()
                .ok_or(DbError::TxDone)?
                .query_row(sql, params)
                .await
        })
        .await
    }

    pub async fn exec(&self, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        let res = self
            .guarded(async {
                let mut conn = self.conn.lock().await;
                conn.as_mut().ok_or(DbError::TxDone)?.exec(sql, params).await
            })
            .await?;
        debug!(
            transaction_id = %self.id,
            sql = %sql,
            rows_affected = res.rows_affected,
            "Executed in transaction"
        );
        Ok(res)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("db_type", &self.db_type)
            .field("state", &self.state())
            .finish()
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}
