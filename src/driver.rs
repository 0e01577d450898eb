//! # Driver Contract
//!
//! Abstraction over the local SQL engine. The store never touches SQL
//! directly: it hands a [`TxRecord`] and its registered [`TxHandler`] to the
//! driver, which opens a transaction, runs the handler against a transaction
//! handle, and commits or rolls back.
//!
//! ## The transaction handle
//!
//! A handler sees one [`Tx`] per invocation. It exposes two views over the
//! same underlying database transaction:
//!
//! - [`Tx::read`]: queries only ([`ReadTx::get`], [`ReadTx::select`]);
//! - [`Tx::read_write`]: everything above plus [`ReadWriteTx::exec`] and
//!   [`ReadWriteTx::delete`].
//!
//! Taking the read-write view sets the handle's sticky did-write flag. The
//! store uses that flag to decide whether the record needs replicating at
//! all: a handler that never asked for the read-write view cannot have
//! mutated anything, so its record is not published.
//!
//! ## Dynamic typing at the seam
//!
//! Arguments, results, and rows are all [`serde_json::Value`]s, because the
//! record (the unit of replication) is JSON on the wire. Rows come back as
//! JSON objects keyed by column name; handlers narrow what they need.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::record::TxRecord;

/// A function that executes a named transaction.
///
/// Handlers must be deterministic functions of their arguments and the prior
/// database state: every replica applies the same record to the same state
/// and must reach the same post-state. In particular, no clocks, no
/// randomness, no I/O beyond the handle.
pub type TxHandler = Arc<dyn Fn(&dyn Tx, &[Value]) -> Result<Value> + Send + Sync>;

/// What a driver reports back from [`Driver::exec`].
#[derive(Debug)]
pub struct ExecOutcome {
    /// The handler's result value.
    pub result: Value,

    /// Whether the handler ever took the read-write view.
    pub did_write: bool,
}

/// An underlying storage driver.
#[async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Applies an ordered sequence of schema statements atomically: either
    /// all succeed or the database is left untouched and an error is
    /// returned. Called exactly once, before any [`exec`](Driver::exec).
    async fn migrate(&self, statements: &[String]) -> Result<()>;

    /// Opens a new database transaction, invokes `handler(handle,
    /// record.args)`, and commits on success. On handler failure the
    /// transaction is rolled back and the returned error distinguishes
    /// "handler failed" from "rollback failed".
    async fn exec(&self, record: TxRecord, handler: TxHandler) -> Result<ExecOutcome>;
}

/// A per-invocation transaction handle.
///
/// Created by the driver at the start of each exec, committed on handler
/// success, rolled back on handler failure, then discarded. Never shared
/// across tasks.
pub trait Tx {
    /// Returns the read-only view.
    fn read(&self) -> &dyn ReadTx;

    /// Returns the read-write view and sets the sticky did-write flag.
    fn read_write(&self) -> &dyn ReadWriteTx;

    /// Whether the read-write view was ever obtained.
    fn did_write(&self) -> bool;
}

/// A read-only transaction view.
pub trait ReadTx {
    /// Runs a query expected to produce exactly one row and returns it as a
    /// JSON object keyed by column name. Zero rows is an error.
    fn get(&self, query: &str, params: &[Value]) -> Result<Value>;

    /// Runs a query producing zero or more rows and returns them in order.
    fn select(&self, query: &str, params: &[Value]) -> Result<Vec<Value>>;
}

/// A read-write transaction view.
pub trait ReadWriteTx: ReadTx {
    /// Runs an insert or update statement and returns the last insert id.
    fn exec(&self, query: &str, params: &[Value]) -> Result<i64>;

    /// Runs a delete statement.
    fn delete(&self, query: &str, params: &[Value]) -> Result<()>;
}
