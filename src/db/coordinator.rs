//! Transaction coordination.
//!
//! [`Database::run`] executes a unit of work inside a transaction scope. If the
//! caller's context already carries a transaction the work joins it; otherwise
//! a new transaction is begun, published on a derived context, and finalized
//! according to how the work ends:
//!
//! | outcome                | action                               | result                |
//! |------------------------|--------------------------------------|-----------------------|
//! | `Ok(value)`            | commit                               | value or commit error |
//! | `Err(e)`               | rollback                             | `e`, or `Rollback`    |
//! | panic                  | rollback                             | panic resumed         |
//! | context canceled first | rollback, work left running detached | context error         |
//!
//! A rollback that finds the transaction already finalized is not treated as a
//! failure; the race between cancellation and completion makes it expected.
//!
//! On cancellation the rollback is awaited for at most [`ROLLBACK_GRACE`].
//! Drivers that cannot interrupt a running statement (SQLite finishes it on
//! its worker thread) queue the `ROLLBACK` behind it; past the grace period
//! the context error is returned and the rollback completes in the
//! background, holding the connection until it does.

use crate::context::{Context, ContextError};
use crate::db::pool::Database;
use crate::db::router::with_context;
use crate::db::transaction::Transaction;
use crate::error::{DbError, DbResult};
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a canceled scope waits for its rollback before returning.
pub const ROLLBACK_GRACE: Duration = Duration::from_millis(250);

impl Database {
    /// Run `f` inside a transaction scope.
    ///
    /// Statements issued through the context handed to `f` execute on the
    /// transaction. Nested calls that receive that context reuse the same
    /// transaction; only the outermost call commits or rolls back.
    ///
    /// The work runs as its own task so the scope can be abandoned on
    /// cancellation. If `ctx` is canceled or its deadline passes first, a
    /// rollback is started and the context error returned once it finishes,
    /// or after [`ROLLBACK_GRACE`] if the driver is still busy with a
    /// statement the work left behind. The task keeps running, and any
    /// statement it issues afterwards fails with [`DbError::TxDone`].
    ///
    /// A rollback still pending at that point keeps the connection until the
    /// driver gets to it, so a one-connection pool stays busy for as long as
    /// the abandoned statement runs.
    pub async fn run<F, Fut, T, E>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + std::error::Error + Send + Sync + 'static,
    {
        if let Some(tx) = ctx.transaction() {
            debug!(transaction_id = %tx.id(), "Joining active transaction");
            return f(ctx.clone()).await;
        }

        let tx = Arc::new(self.begin(ctx).await?);
        let guard = RollbackGuard::new(Arc::clone(&tx));
        let tx_ctx = ctx.with_transaction(Arc::clone(&tx));
        let mut work = tokio::spawn(async move { f(tx_ctx).await });

        let result = tokio::select! {
            biased;
            err = ctx.cancelled() => {
                let rollback = match rollback_within(&tx, ROLLBACK_GRACE).await {
                    Some(rollback) => {
                        warn!(
                            transaction_id = %tx.id(),
                            reason = %err,
                            "Context done before transaction completed, rolled back"
                        );
                        rollback
                    }
                    None => {
                        warn!(
                            transaction_id = %tx.id(),
                            reason = %err,
                            grace_ms = ROLLBACK_GRACE.as_millis() as u64,
                            "Context done before transaction completed, rollback still waiting on the driver"
                        );
                        Ok(())
                    }
                };
                Err(E::from(cancellation_error(err, rollback)))
            }
            joined = &mut work => match joined {
                Ok(Ok(value)) => tx.commit().await.map(|()| value).map_err(E::from),
                Ok(Err(e)) => {
                    let rollback = tx.rollback().await;
                    Err(callback_error(e, rollback))
                }
                Err(join_err) if join_err.is_panic() => {
                    let payload = join_err.into_panic();
                    warn!(
                        transaction_id = %tx.id(),
                        panic = %panic_message(payload.as_ref()),
                        "Transaction work panicked, rolling back"
                    );
                    let rollback = tx.rollback().await;
                    resume_panic(payload, rollback)
                }
                Err(join_err) => {
                    let rollback = tx.rollback().await;
                    let err = DbError::internal(format!("transaction work was aborted: {join_err}"));
                    Err(E::from(match rollback {
                        Err(rerr) if !rerr.is_tx_done() => DbError::rollback(err, rerr),
                        _ => err,
                    }))
                }
            }
        };
        guard.disarm();
        result
    }

    /// Begin a transaction unless `ctx` finishes first.
    async fn begin(&self, ctx: &Context) -> DbResult<Transaction> {
        with_context(ctx, Transaction::begin(self.pool())).await
    }
}

/// Rolls the transaction back if the coordinating future is dropped before
/// it finalized the transaction itself.
struct RollbackGuard {
    tx: Option<Arc<Transaction>>,
}

impl RollbackGuard {
    fn new(tx: Arc<Transaction>) -> Self {
        Self { tx: Some(tx) }
    }

    fn disarm(mut self) {
        self.tx = None;
    }
}

impl Drop for RollbackGuard {
    fn drop(&mut self) {
        let Some(tx) = self.tx.take() else {
            return;
        };
        if tx.is_finalized() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!(transaction_id = %tx.id(), "Coordinator dropped, rolling back");
            handle.spawn(async move {
                let _ = tx.rollback().await;
            });
        }
    }
}

/// Roll back on a separate task and wait up to `grace` for it.
///
/// `None` means the rollback is still queued behind the driver; it carries on
/// in the background.
async fn rollback_within(tx: &Arc<Transaction>, grace: Duration) -> Option<DbResult<()>> {
    let pending = Arc::clone(tx);
    let mut rollback = tokio::spawn(async move {
        let result = pending.rollback().await;
        if let Err(e) = &result {
            if !e.is_tx_done() {
                warn!(transaction_id = %pending.id(), error = %e, "Rollback failed");
            }
        }
        result
    });

    match tokio::time::timeout(grace, &mut rollback).await {
        Ok(Ok(result)) => Some(result),
        Ok(Err(join_err)) => Some(Err(DbError::internal(format!(
            "rollback task failed: {join_err}"
        )))),
        Err(_) => None,
    }
}

fn cancellation_error(cause: ContextError, rollback: DbResult<()>) -> DbError {
    match rollback {
        Err(rerr) if !rerr.is_tx_done() => DbError::finalize(cause, rerr),
        _ => DbError::Context(cause),
    }
}

fn callback_error<E>(err: E, rollback: DbResult<()>) -> E
where
    E: From<DbError> + std::error::Error + Send + Sync + 'static,
{
    match rollback {
        Err(rerr) if !rerr.is_tx_done() => E::from(DbError::rollback(err, rerr)),
        _ => err,
    }
}

/// Re-raise a panic from the work task once the transaction is rolled back.
///
/// When the rollback itself failed the new panic carries both messages.
fn resume_panic(payload: Box<dyn Any + Send>, rollback: DbResult<()>) -> ! {
    match rollback {
        Err(rerr) if !rerr.is_tx_done() => {
            panic!("{}: {}", rerr, panic_message(payload.as_ref()))
        }
        _ => std::panic::resume_unwind(payload),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    enum AppError {
        #[error("app failed")]
        App,
        #[error(transparent)]
        Db(#[from] DbError),
    }

    #[test]
    fn test_cancellation_error_ignores_tx_done() {
        let err = cancellation_error(ContextError::Canceled, Err(DbError::TxDone));
        assert!(matches!(err, DbError::Context(ContextError::Canceled)));

        let err = cancellation_error(ContextError::DeadlineExceeded, Ok(()));
        assert_eq!(err.context_error(), Some(ContextError::DeadlineExceeded));
    }

    #[test]
    fn test_cancellation_error_combines_rollback_failure() {
        let err = cancellation_error(
            ContextError::DeadlineExceeded,
            Err(DbError::database("rollback failed", None, "")),
        );
        assert!(matches!(err, DbError::Finalize { .. }));
        assert_eq!(err.context_error(), Some(ContextError::DeadlineExceeded));
        assert_eq!(
            err.to_string(),
            format!(
                "{}: {}",
                DbError::database("rollback failed", None, ""),
                ContextError::DeadlineExceeded
            )
        );
    }

    #[test]
    fn test_callback_error_passthrough() {
        let err = callback_error(AppError::App, Ok(()));
        assert!(matches!(err, AppError::App));

        let err = callback_error(AppError::App, Err(DbError::TxDone));
        assert!(matches!(err, AppError::App));
    }

    #[test]
    fn test_callback_error_combines_rollback_failure() {
        let err = callback_error(
            AppError::App,
            Err(DbError::database("rollback failed", None, "")),
        );
        assert_eq!(err.to_string(), "app failed: Database error: rollback failed");
        match err {
            AppError::Db(DbError::Rollback { cause, .. }) => {
                assert_eq!(cause.to_string(), "app failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
