//! Explicit transactions.
//!
//! A session owns a [`Transaction`] and the table locks taken inside it.
//! Requests join a session through `RequestOptions::session` or through a
//! [`TxHandle`]. Locks are released when the session commits or rolls back.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use acldb_proto::{Request, Response};

use crate::error::Result;
use crate::storage::{Transaction, TransactionMode};

use super::engine::Engine;

/// An open explicit transaction.
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) tx: Arc<Transaction>,
    locks: Mutex<Vec<(String, OwnedMutexGuard<()>)>>,
}

impl Session {
    fn holds(&self, class_name: &str) -> bool {
        self.locks.lock().iter().any(|(held, _)| held == class_name)
    }

    fn release_locks(&self) {
        let released = std::mem::take(&mut *self.locks.lock());
        if !released.is_empty() {
            debug!(session = %self.id, tables = released.len(), "released table locks");
        }
    }
}

/// Access to one open transaction.
#[derive(Clone)]
pub struct TxHandle {
    engine: Engine,
    session: Arc<Session>,
}

impl TxHandle {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Run a request inside this transaction.
    pub async fn execute(&self, mut request: Request) -> Result<Response> {
        request.options.session = Some(self.session.id.clone());
        self.engine.execute_on(&*self.session.tx, request).await
    }

    /// Run `f` under a savepoint: its writes are kept on success and
    /// discarded on error, without ending the outer transaction.
    pub async fn nested<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let depth = self.session.tx.savepoint();
        match f(self.clone()).await {
            Ok(value) => {
                self.session.tx.release(depth);
                Ok(value)
            }
            Err(e) => {
                self.session.tx.rollback_to(depth);
                debug!(session = %self.session.id, depth, error = %e, "savepoint rolled back");
                Err(e)
            }
        }
    }

    /// Open a transaction inside this one.
    ///
    /// No independent transaction is started: `f` runs under a savepoint as
    /// with [`TxHandle::nested`], and its writes commit with the outer scope.
    pub async fn transaction<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.nested(f).await
    }

    /// Take the exclusive lock on a class until this transaction ends.
    pub async fn lock_table(&self, class_name: &str) -> Result<()> {
        self.engine.schema().require(class_name)?;
        if self.session.holds(class_name) {
            return Ok(());
        }
        let lock = self
            .engine
            .inner
            .locks
            .entry(class_name.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        debug!(session = %self.session.id, class = %class_name, "table locked");
        self.session.locks.lock().push((class_name.to_string(), guard));
        Ok(())
    }
}

impl Engine {
    /// Open an explicit transaction and return its session id.
    pub fn begin(&self, mode: TransactionMode) -> String {
        let id = Uuid::new_v4().to_string();
        let session = Session {
            id: id.clone(),
            tx: Arc::new(Transaction::new(self.backend(), mode)),
            locks: Mutex::new(Vec::new()),
        };
        self.inner.sessions.insert(id.clone(), Arc::new(session));
        debug!(session = %id, ?mode, "transaction opened");
        id
    }

    /// Handle for an open session.
    pub fn handle(&self, session_id: &str) -> Result<TxHandle> {
        Ok(TxHandle {
            engine: self.clone(),
            session: self.session(session_id)?,
        })
    }

    /// Commit an open session. The session ends whether or not the commit succeeds.
    pub async fn commit(&self, session_id: &str) -> Result<()> {
        let session = self.end(session_id)?;
        let result = session.tx.commit_to_base().await;
        session.release_locks();
        if result.is_ok() {
            info!(session = %session_id, writes = session.tx.pending(), "transaction committed");
        }
        result
    }

    /// Discard an open session.
    pub fn rollback(&self, session_id: &str) -> Result<()> {
        let session = self.end(session_id)?;
        session.release_locks();
        debug!(session = %session_id, discarded = session.tx.pending(), "transaction rolled back");
        Ok(())
    }

    fn end(&self, session_id: &str) -> Result<Arc<Session>> {
        self.inner
            .sessions
            .remove(session_id)
            .map(|(_, session)| session)
            .ok_or_else(|| crate::error::BackendError::UnknownSession(session_id.to_string()).into())
    }

    /// Run `f` in a transaction and commit it.
    ///
    /// In [`TransactionMode::Repeatable`], serialization conflicts restart
    /// `f` in a fresh transaction, up to `max_transaction_attempts` times.
    ///
    /// Every call opens an independent transaction. Inside `f`, open inner
    /// scopes through [`TxHandle::transaction`] so they become savepoints.
    pub async fn transaction<F, Fut, T>(&self, mode: TransactionMode, mut f: F) -> Result<T>
    where
        F: FnMut(TxHandle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = match mode {
            TransactionMode::Repeatable => self.inner.config.max_transaction_attempts,
            TransactionMode::Default => 1,
        };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let id = self.begin(mode);
            let outcome = match f(self.handle(&id)?).await {
                Ok(value) => self.commit(&id).await.map(|()| value),
                Err(e) => {
                    self.rollback(&id)?;
                    Err(e)
                }
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(attempt, error = %e, "transaction conflict, retrying");
                    tokio::time::sleep(self.inner.config.retry_backoff * attempt as u32).await;
                }
                other => return other,
            }
        }
    }
}
