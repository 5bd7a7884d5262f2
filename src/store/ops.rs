// src/store/ops.rs

//! Deferred store mutations
//!
//! Every mutation on the store updates the in-memory model immediately and
//! queues one of these operations. The queue is drained in enqueue order
//! inside a single SQLite transaction when the outermost lock is released.

use crate::error::Result;
use crate::store::models::{
    Application, Revision, Transaction, TransactionAppState, TransactionLog, TransactionStatus,
};
use rusqlite::Connection;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredOp {
    AddApplication(Application),
    RemoveApplication { id: i64 },
    AddRevision {
        application_id: i64,
        revision: Revision,
    },
    AddTransaction(Transaction),
    UpdateTransaction(Transaction),
    AddTransactionState(TransactionAppState),
    UpdateTransactionState(TransactionAppState),
    CompleteTransaction {
        id: u32,
        state: TransactionStatus,
        completed_at: i64,
    },
    AddTransactionLog(TransactionLog),
    RemoveTransaction { id: u32 },
}

impl DeferredOp {
    pub fn kind(&self) -> &'static str {
        match self {
            DeferredOp::AddApplication(_) => "add-application",
            DeferredOp::RemoveApplication { .. } => "remove-application",
            DeferredOp::AddRevision { .. } => "add-revision",
            DeferredOp::AddTransaction(_) => "add-transaction",
            DeferredOp::UpdateTransaction(_) => "update-transaction",
            DeferredOp::AddTransactionState(_) => "add-transaction-state",
            DeferredOp::UpdateTransactionState(_) => "update-transaction-state",
            DeferredOp::CompleteTransaction { .. } => "complete-transaction",
            DeferredOp::AddTransactionLog(_) => "add-transaction-log",
            DeferredOp::RemoveTransaction { .. } => "remove-transaction",
        }
    }

    /// Write this operation through `conn`
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        match self {
            DeferredOp::AddApplication(app) => app.insert(conn),
            DeferredOp::RemoveApplication { id } => Application::delete(conn, *id),
            DeferredOp::AddRevision {
                application_id,
                revision,
            } => revision.insert(conn, *application_id),
            DeferredOp::AddTransaction(tx) => tx.insert(conn),
            DeferredOp::UpdateTransaction(tx) => tx.update(conn),
            DeferredOp::AddTransactionState(state) => state.insert(conn),
            DeferredOp::UpdateTransactionState(state) => state.update(conn),
            DeferredOp::CompleteTransaction {
                id,
                state,
                completed_at,
            } => Transaction::complete(conn, *id, *state, *completed_at),
            DeferredOp::AddTransactionLog(log) => log.insert(conn),
            DeferredOp::RemoveTransaction { id } => Transaction::delete(conn, *id),
        }
    }
}
