// src/store/mod.rs

//! Persistent state store
//!
//! Applications and transactions live in memory and are mirrored into
//! SQLite. All access goes through a [`StoreGuard`] obtained from
//! [`Store::lock`]. Guards nest: `guard.lock()` increments the lock count,
//! and only the release of the outermost guard drains the deferred
//! operation queue, inside one SQLite transaction.
//!
//! Reads return borrows tied to the guard, so they cannot outlive the lock.
//! Mutations update memory synchronously so later reads under the same lock
//! observe them.
//!
//! If a flush fails the SQLite transaction is rolled back but memory is not
//! reverted. The store is then marked dirty and refuses further mutations
//! with [`Error::StateInconsistent`] until [`StoreGuard::reload`] (or
//! [`Store::reload`]) re-reads the durable state.

mod models;
mod ops;
pub mod schema;

pub use models::{
    AppCommand, Application, LogLevel, Revision, Transaction, TransactionAppState,
    TransactionLog, TransactionStatus, TransactionType, Wait, WaitType,
};
pub use ops::DeferredOp;

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Completed transactions older than this are eligible for cleanup
pub const CLEANUP_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

/// Number of most recently completed transactions always retained
pub const CLEANUP_KEEP: usize = 10;

struct StoreInner {
    conn: Connection,
    lock_count: usize,
    applications: Vec<Application>,
    transactions: Vec<Transaction>,
    states: Vec<TransactionAppState>,
    logs: Vec<TransactionLog>,
    queue: Vec<DeferredOp>,
    next_application_id: i64,
    next_transaction_id: u32,
    next_state_id: i64,
    next_log_id: i64,
    dirty: bool,
}

impl StoreInner {
    fn load(conn: Connection) -> Result<Self> {
        let mut inner = Self {
            conn,
            lock_count: 0,
            applications: Vec::new(),
            transactions: Vec::new(),
            states: Vec::new(),
            logs: Vec::new(),
            queue: Vec::new(),
            next_application_id: 1,
            next_transaction_id: 1,
            next_state_id: 1,
            next_log_id: 1,
            dirty: false,
        };
        inner.reload()?;
        Ok(inner)
    }

    fn reload(&mut self) -> Result<()> {
        self.applications = Application::list_all(&self.conn)?;
        self.transactions = Transaction::list_all(&self.conn)?;
        self.states = TransactionAppState::list_all(&self.conn)?;
        self.logs = TransactionLog::list_all(&self.conn)?;
        self.next_application_id = models::max_id(&self.conn, "applications")? + 1;
        self.next_transaction_id = Transaction::next_id(&self.conn)?;
        self.next_state_id = models::max_id(&self.conn, "transactions_state")? + 1;
        self.next_log_id = models::max_id(&self.conn, "transaction_logs")? + 1;
        self.queue.clear();
        self.dirty = false;
        debug!(
            "Loaded state: {} applications, {} transactions",
            self.applications.len(),
            self.transactions.len()
        );
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.queue);
        match apply_batch(&mut self.conn, &ops) {
            Ok(()) => {
                debug!("Flushed {} deferred operations", ops.len());
                Ok(())
            }
            Err((index, e)) => {
                self.dirty = true;
                Err(Error::StateInconsistent(format!(
                    "flush of {} deferred operations failed at {} ({}): {}",
                    ops.len(),
                    index,
                    ops[index].kind(),
                    e
                )))
            }
        }
    }
}

/// Apply every op in one SQLite transaction; dropping the transaction on
/// error rolls it back
fn apply_batch(
    conn: &mut Connection,
    ops: &[DeferredOp],
) -> std::result::Result<(), (usize, Error)> {
    let tx = conn.transaction().map_err(|e| (0, Error::from(e)))?;
    for (index, op) in ops.iter().enumerate() {
        op.apply(&tx).map_err(|e| (index, e))?;
    }
    tx.commit()
        .map_err(|e| (ops.len().saturating_sub(1), Error::from(e)))
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// State store handle; owned by the top-level build context
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Open (creating if needed) the store database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        info!("Opening state store at {}", path.display());
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            inner: Mutex::new(StoreInner::load(conn)?),
        })
    }

    /// Acquire the store lock
    pub fn lock(&self) -> StoreGuard<'_> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.lock_count += 1;
        StoreGuard {
            held: Held::Owned(guard),
            released: false,
        }
    }

    /// Discard memory and pending ops and re-read the durable state
    pub fn reload(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard.reload()
    }
}

enum Held<'a> {
    Owned(MutexGuard<'a, StoreInner>),
    Nested(&'a mut StoreInner),
}

/// Scoped store lock
///
/// Dropping the outermost guard flushes the deferred queue; a failure is
/// logged and leaves the store dirty. Use [`StoreGuard::unlock`] to observe
/// the flush result.
pub struct StoreGuard<'a> {
    held: Held<'a>,
    released: bool,
}

impl StoreGuard<'_> {
    fn inner(&self) -> &StoreInner {
        match &self.held {
            Held::Owned(guard) => &**guard,
            Held::Nested(inner) => &**inner,
        }
    }

    fn inner_mut(&mut self) -> &mut StoreInner {
        match &mut self.held {
            Held::Owned(guard) => &mut **guard,
            Held::Nested(inner) => &mut **inner,
        }
    }

    /// Re-enter the lock; the returned guard must be released first
    pub fn lock(&mut self) -> StoreGuard<'_> {
        let inner = self.inner_mut();
        inner.lock_count += 1;
        StoreGuard {
            held: Held::Nested(inner),
            released: false,
        }
    }

    /// Release this level of the lock, flushing if it is the outermost
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let inner = self.inner_mut();
        inner.lock_count = inner.lock_count.saturating_sub(1);
        if inner.lock_count == 0 {
            inner.flush()
        } else {
            Ok(())
        }
    }

    pub fn lock_count(&self) -> usize {
        self.inner().lock_count
    }

    pub fn pending_ops(&self) -> usize {
        self.inner().queue.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner().dirty
    }

    pub fn reload(&mut self) -> Result<()> {
        self.inner_mut().reload()
    }

    // Reads

    pub fn applications(&self) -> &[Application] {
        &self.inner().applications
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.inner().applications.iter().find(|a| a.name == name)
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.inner().transactions
    }

    pub fn transaction(&self, id: u32) -> Option<&Transaction> {
        self.inner().transactions.iter().find(|t| t.id == id)
    }

    pub fn transaction_states(&self) -> &[TransactionAppState] {
        &self.inner().states
    }

    pub fn transaction_logs(&self, id: u32) -> Vec<&TransactionLog> {
        self.inner()
            .logs
            .iter()
            .filter(|l| l.transaction_id == id)
            .collect()
    }

    // Mutations

    fn writable(&mut self) -> Result<&mut StoreInner> {
        let inner = self.inner_mut();
        if inner.dirty {
            return Err(Error::StateInconsistent(
                "state store failed to flush; reload before making changes".to_string(),
            ));
        }
        Ok(inner)
    }

    pub fn add_application(
        &mut self,
        name: &str,
        commands: Vec<AppCommand>,
        revisions: Vec<Revision>,
    ) -> Result<i64> {
        let inner = self.writable()?;
        if inner.applications.iter().any(|a| a.name == name) {
            return Err(Error::validation(
                "application",
                format!("'{name}' already exists"),
            ));
        }
        let app = Application {
            id: inner.next_application_id,
            name: name.to_string(),
            commands,
            revisions,
        };
        inner.next_application_id += 1;
        let id = app.id;
        inner.applications.push(app.clone());
        inner.queue.push(DeferredOp::AddApplication(app));
        Ok(id)
    }

    pub fn remove_application(&mut self, name: &str) -> Result<()> {
        let inner = self.writable()?;
        let index = inner
            .applications
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::NotFound(format!("application '{name}'")))?;
        let app = inner.applications.remove(index);
        inner.queue.push(DeferredOp::RemoveApplication { id: app.id });
        Ok(())
    }

    /// Append a revision to an existing application
    pub fn add_revision(&mut self, name: &str, revision: Revision) -> Result<()> {
        let inner = self.writable()?;
        let app = inner
            .applications
            .iter_mut()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::NotFound(format!("application '{name}'")))?;
        app.revisions.push(revision.clone());
        let application_id = app.id;
        inner.queue.push(DeferredOp::AddRevision {
            application_id,
            revision,
        });
        Ok(())
    }

    pub fn add_transaction(
        &mut self,
        transaction_type: TransactionType,
        name: &str,
        description: Option<&str>,
    ) -> Result<u32> {
        let inner = self.writable()?;
        let tx = Transaction {
            id: inner.next_transaction_id,
            transaction_type,
            flags: 0,
            state: TransactionStatus::Queued,
            name: name.to_string(),
            description: description.map(str::to_string),
            wait: Wait::default(),
            created_at: now(),
            completed_at: None,
        };
        inner.next_transaction_id += 1;
        let id = tx.id;
        inner.transactions.push(tx.clone());
        inner.queue.push(DeferredOp::AddTransaction(tx));
        Ok(id)
    }

    fn transaction_mut(inner: &mut StoreInner, id: u32) -> Result<&mut Transaction> {
        inner
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("transaction {id}")))
    }

    /// Move a transaction to a new state; terminal states complete it
    pub fn set_transaction_state(&mut self, id: u32, state: TransactionStatus) -> Result<()> {
        if state.is_terminal() {
            return self.complete_transaction(id, state);
        }
        let inner = self.writable()?;
        let tx = Self::transaction_mut(inner, id)?;
        if tx.state.is_terminal() {
            return Err(Error::validation(
                "transaction",
                format!("{id} is already {}", tx.state.as_str()),
            ));
        }
        tx.state = state;
        let snapshot = tx.clone();
        inner.queue.push(DeferredOp::UpdateTransaction(snapshot));
        Ok(())
    }

    pub fn set_transaction_wait(&mut self, id: u32, wait: Wait) -> Result<()> {
        let inner = self.writable()?;
        let tx = Self::transaction_mut(inner, id)?;
        tx.wait = wait;
        let snapshot = tx.clone();
        inner.queue.push(DeferredOp::UpdateTransaction(snapshot));
        Ok(())
    }

    pub fn set_transaction_flags(&mut self, id: u32, flags: u32) -> Result<()> {
        let inner = self.writable()?;
        let tx = Self::transaction_mut(inner, id)?;
        tx.flags = flags;
        let snapshot = tx.clone();
        inner.queue.push(DeferredOp::UpdateTransaction(snapshot));
        Ok(())
    }

    pub fn complete_transaction(&mut self, id: u32, state: TransactionStatus) -> Result<()> {
        self.complete_transaction_at(id, state, now())
    }

    /// Complete a transaction with an explicit completion time (unix seconds)
    pub fn complete_transaction_at(
        &mut self,
        id: u32,
        state: TransactionStatus,
        completed_at: i64,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::validation(
                "transaction",
                format!("{} is not a terminal state", state.as_str()),
            ));
        }
        let inner = self.writable()?;
        let tx = Self::transaction_mut(inner, id)?;
        tx.state = state;
        tx.completed_at = Some(completed_at);
        inner.queue.push(DeferredOp::CompleteTransaction {
            id,
            state,
            completed_at,
        });
        Ok(())
    }

    pub fn add_transaction_state(
        &mut self,
        transaction_id: u32,
        name: &str,
        channel: Option<&str>,
        revision: i64,
    ) -> Result<i64> {
        let inner = self.writable()?;
        Self::transaction_mut(inner, transaction_id)?;
        let state = TransactionAppState {
            id: inner.next_state_id,
            transaction_id,
            name: name.to_string(),
            channel: channel.map(str::to_string),
            revision,
        };
        inner.next_state_id += 1;
        let id = state.id;
        inner.states.push(state.clone());
        inner.queue.push(DeferredOp::AddTransactionState(state));
        Ok(id)
    }

    pub fn update_transaction_state(
        &mut self,
        state_id: i64,
        channel: Option<&str>,
        revision: i64,
    ) -> Result<()> {
        let inner = self.writable()?;
        let state = inner
            .states
            .iter_mut()
            .find(|s| s.id == state_id)
            .ok_or_else(|| Error::NotFound(format!("transaction state {state_id}")))?;
        state.channel = channel.map(str::to_string);
        state.revision = revision;
        let snapshot = state.clone();
        inner.queue.push(DeferredOp::UpdateTransactionState(snapshot));
        Ok(())
    }

    pub fn add_transaction_log(
        &mut self,
        transaction_id: u32,
        level: LogLevel,
        message: &str,
    ) -> Result<()> {
        let inner = self.writable()?;
        let state = Self::transaction_mut(inner, transaction_id)?.state;
        let log = TransactionLog {
            id: inner.next_log_id,
            transaction_id,
            level,
            timestamp: now(),
            state,
            message: message.to_string(),
        };
        inner.next_log_id += 1;
        inner.logs.push(log.clone());
        inner.queue.push(DeferredOp::AddTransactionLog(log));
        Ok(())
    }

    pub fn transaction_cleanup(&mut self) -> Result<usize> {
        self.transaction_cleanup_at(now())
    }

    /// Remove completed transactions older than seven days, always keeping
    /// the ten most recently completed
    pub fn transaction_cleanup_at(&mut self, now: i64) -> Result<usize> {
        let inner = self.writable()?;
        let cutoff = now - CLEANUP_MAX_AGE_SECS;

        let mut completed: Vec<(i64, u32)> = inner
            .transactions
            .iter()
            .filter_map(|t| t.completed_at.map(|at| (at, t.id)))
            .collect();
        completed.sort_by(|a, b| b.cmp(a));

        let doomed: Vec<u32> = completed
            .into_iter()
            .skip(CLEANUP_KEEP)
            .filter(|(at, _)| *at < cutoff)
            .map(|(_, id)| id)
            .collect();

        for id in &doomed {
            inner.transactions.retain(|t| t.id != *id);
            inner.states.retain(|s| s.transaction_id != *id);
            inner.logs.retain(|l| l.transaction_id != *id);
            inner.queue.push(DeferredOp::RemoveTransaction { id: *id });
        }
        if !doomed.is_empty() {
            info!("Cleaned up {} old transactions", doomed.len());
        }
        Ok(doomed.len())
    }
}

impl Drop for StoreGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                warn!("State store flush failed: {}", e);
            }
        }
    }
}
