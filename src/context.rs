//! Request-scoped execution context.
//!
//! A [`Context`] is an immutable handle passed down a call chain. It carries
//! cancellation (an explicit cancel signal and an optional deadline), at most
//! one active [`Transaction`], and typed request-scoped values. Deriving a
//! child never mutates the parent; cancellation flows from parent to child,
//! never the other way.
//!
//! ```ignore
//! let (ctx, cancel) = Context::background().with_timeout(Duration::from_secs(5));
//! db.run(&ctx, |tx_ctx| async move { /* ... */ Ok::<_, DbError>(()) }).await?;
//! cancel.cancel();
//! ```

use crate::db::Transaction;
use std::any::{Any, TypeId};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// One node of the cancellation tree.
#[derive(Debug)]
struct Scope {
    parent: Option<Arc<Scope>>,
    token: CancellationToken,
    /// Earliest deadline along the chain.
    deadline: Option<Instant>,
    canceled_at: OnceLock<Instant>,
}

impl Scope {
    fn root() -> Self {
        Self {
            parent: None,
            token: CancellationToken::new(),
            deadline: None,
            canceled_at: OnceLock::new(),
        }
    }

    fn child(parent: &Arc<Scope>, deadline: Option<Instant>) -> Self {
        let deadline = match (parent.deadline, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            parent: Some(Arc::clone(parent)),
            token: parent.token.child_token(),
            deadline,
            canceled_at: OnceLock::new(),
        }
    }

    fn cancel(&self) {
        // First cancel wins; later calls keep the original instant.
        let _ = self.canceled_at.set(Instant::now());
        self.token.cancel();
    }

    /// Earliest explicit cancellation along the chain.
    fn canceled_at(&self) -> Option<Instant> {
        let mut earliest: Option<Instant> = None;
        let mut node = Some(self);
        while let Some(scope) = node {
            if let Some(at) = scope.canceled_at.get() {
                earliest = Some(earliest.map_or(*at, |e| e.min(*at)));
            }
            node = scope.parent.as_deref();
        }
        earliest
    }

    fn err(&self) -> Option<ContextError> {
        let expired = self.deadline.filter(|d| *d <= Instant::now());
        match (self.canceled_at(), expired) {
            (Some(canceled), Some(deadline)) if deadline < canceled => {
                Some(ContextError::DeadlineExceeded)
            }
            (Some(_), _) => Some(ContextError::Canceled),
            (None, Some(_)) => Some(ContextError::DeadlineExceeded),
            (None, None) => None,
        }
    }
}

/// Typed value binding; lookups walk towards the root.
struct ValueNode {
    parent: Option<Arc<ValueNode>>,
    key: TypeId,
    value: Arc<dyn Any + Send + Sync>,
}

/// Immutable, clonable request context.
#[derive(Clone)]
pub struct Context {
    scope: Arc<Scope>,
    transaction: Option<Arc<Transaction>>,
    values: Option<Arc<ValueNode>>,
}

impl Context {
    /// A root context: never canceled, no deadline, no transaction.
    pub fn background() -> Self {
        Self {
            scope: Arc::new(Scope::root()),
            transaction: None,
            values: None,
        }
    }

    fn derive(&self, deadline: Option<Instant>) -> (Self, CancelHandle) {
        let scope = Arc::new(Scope::child(&self.scope, deadline));
        let ctx = Self {
            scope: Arc::clone(&scope),
            transaction: self.transaction.clone(),
            values: self.values.clone(),
        };
        (ctx, CancelHandle { scope })
    }

    /// Child context canceled by the returned handle or by any ancestor.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        self.derive(None)
    }

    /// Child context that is done at `deadline` at the latest.
    pub fn with_deadline(&self, deadline: Instant) -> (Self, CancelHandle) {
        self.derive(Some(deadline))
    }

    /// Child context that is done after `timeout` at the latest.
    pub fn with_timeout(&self, timeout: Duration) -> (Self, CancelHandle) {
        self.derive(Some(Instant::now() + timeout))
    }

    /// Child context reporting `tx` as its active transaction.
    ///
    /// Cancellation, deadline and values are shared with `self`.
    pub fn with_transaction(&self, tx: Arc<Transaction>) -> Self {
        Self {
            scope: Arc::clone(&self.scope),
            transaction: Some(tx),
            values: self.values.clone(),
        }
    }

    /// Child context carrying `value`, shadowing any value of the same type.
    pub fn with_value<T: Any + Send + Sync>(&self, value: T) -> Self {
        let node = ValueNode {
            parent: self.values.clone(),
            key: TypeId::of::<T>(),
            value: Arc::new(value),
        };
        Self {
            scope: Arc::clone(&self.scope),
            transaction: self.transaction.clone(),
            values: Some(Arc::new(node)),
        }
    }

    /// Nearest value of type `T`.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<&T> {
        let key = TypeId::of::<T>();
        let mut node = self.values.as_deref();
        while let Some(n) = node {
            if n.key == key {
                return n.value.downcast_ref::<T>();
            }
            node = n.parent.as_deref();
        }
        None
    }

    /// The active transaction, if one has been published on this chain.
    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    /// Effective deadline (earliest along the chain).
    pub fn deadline(&self) -> Option<Instant> {
        self.scope.deadline
    }

    /// `None` while the context is live, otherwise why it is done.
    pub fn err(&self) -> Option<ContextError> {
        self.scope.err()
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolves once the context is canceled or its deadline passes.
    ///
    /// Never resolves for a background context.
    pub async fn done(&self) {
        let canceled = self.scope.token.cancelled();
        match self.scope.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = canceled => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => canceled.await,
        }
    }

    /// `done()` followed by `err()`; the error is always present.
    pub async fn cancelled(&self) -> ContextError {
        self.done().await;
        self.err().unwrap_or(ContextError::Canceled)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.scope.deadline)
            .field("err", &self.err())
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.id()))
            .finish()
    }
}

/// Cancels the context it was created with, and all of its descendants.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    scope: Arc<Scope>,
}

impl CancelHandle {
    /// Idempotent.
    pub fn cancel(&self) {
        self.scope.cancel();
    }
}
