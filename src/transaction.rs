//! Connection-bound transaction scopes.
//!
//! A [`TransactionScope`] owns one connection for its whole life. Writes made
//! through it stay invisible to every other connection until [`commit`]; a
//! scope that is dropped without being committed or rolled back is rolled
//! back on drop, so the connection is released on every exit path.
//!
//! [`commit`]: TransactionScope::commit

use std::sync::atomic::{AtomicU64, Ordering};

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::error::{Result, StoreContext};
use crate::sqlite::Store;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle to an open transaction.
#[derive(Debug)]
pub struct TransactionScope {
    id: u64,
    conn: Option<Connection>,
}

impl TransactionScope {
    /// Acquire a dedicated connection and start a write transaction on it.
    pub fn begin(store: &Store) -> Result<Self> {
        let conn = store.connect()?;
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        conn.execute_batch("BEGIN IMMEDIATE")
            .store_context(|| format!("begin transaction {id}"))?;
        debug!("transaction {} started", id);
        Ok(Self {
            id,
            conn: Some(conn),
        })
    }

    /// Make every write issued through this scope durable and release the connection.
    pub fn commit(mut self) -> Result<()> {
        let conn = self.take_connection();
        let id = self.id;
        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                debug!("transaction {} committed", id);
                Ok(())
            }
            Err(source) => {
                warn!("transaction {} failed to commit: {}", id, source);
                if !conn.is_autocommit() {
                    let _ = conn.execute_batch("ROLLBACK");
                }
                Err::<(), _>(source).store_context(|| format!("commit transaction {id}"))
            }
        }
    }

    /// Discard every write issued through this scope and release the connection.
    pub fn rollback(mut self) -> Result<()> {
        let conn = self.take_connection();
        let id = self.id;
        warn!("transaction {} rolled back", id);
        conn.execute_batch("ROLLBACK")
            .store_context(|| format!("roll back transaction {id}"))
    }

    pub(crate) fn connection(&self) -> &Connection {
        // Only commit/rollback take the connection, and both consume the scope.
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("transaction scope used after it finished"))
    }

    fn take_connection(&mut self) -> Connection {
        self.conn
            .take()
            .unwrap_or_else(|| unreachable!("transaction scope finished twice"))
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "transaction {} dropped without commit or rollback, rolling back",
                self.id
            );
            if !conn.is_autocommit() {
                if let Err(err) = conn.execute_batch("ROLLBACK") {
                    warn!("transaction {} rollback on drop failed: {}", self.id, err);
                }
            }
        }
    }
}

impl Store {
    /// Run `work` inside one transaction scope: commit on `Ok`, roll back on `Err`.
    pub fn in_transaction<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&TransactionScope) -> Result<T>,
    {
        let scope = TransactionScope::begin(self)?;
        match work(&scope) {
            Ok(value) => {
                scope.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = scope.rollback() {
                    warn!("rollback after failure also failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }
}
