//! # SQLite Driver
//!
//! Reference implementation of the [`Driver`] contract on SQLite.
//!
//! ## Fresh database per startup
//!
//! Local state is a disposable replica of the log, so every startup gets an
//! empty database: the file lives under the user cache directory, namespaced
//! by service name, with a time-ordered UUID embedded in the file name.
//! Rebuilding happens by replay; nothing of value is ever in the file.
//!
//! ## The `!Sync` connection
//!
//! SQLite's `Connection` uses `RefCell` internally and cannot be shared
//! across threads. A dedicated writer thread owns it; async callers talk to
//! the thread over a channel and get their answer on a oneshot:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      Async Tasks                          │
//! │   exec ─┐                                                 │
//! │   exec ─┼── tokio::sync::mpsc ──► ┌───────────────────┐   │
//! │   apply ┘                         │  Dedicated Thread │   │
//! │                                   │   ┌────────────┐  │   │
//! │        ◄── oneshot responses ──── │   │ Connection │  │   │
//! │                                   │   └────────────┘  │   │
//! │                                   └───────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! A useful side effect: every transaction, the write path's local commit
//! and the apply loop's replayed records alike, funnels through one thread,
//! so handlers never race on the database.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

use crate::driver::{Driver, ExecOutcome, ReadTx, ReadWriteTx, Tx, TxHandler};
use crate::error::{Error, Result};
use crate::record::TxRecord;

/// Size of the request channel to the writer thread.
const REQUEST_CHANNEL_SIZE: usize = 256;

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests served by the writer thread.
enum Request {
    Migrate {
        statements: Vec<String>,
        resp: oneshot::Sender<Result<()>>,
    },
    Exec {
        record: TxRecord,
        handler: TxHandler,
        resp: oneshot::Sender<Result<ExecOutcome>>,
    },
}

/// SQLite [`Driver`] for the libsdk store.
///
/// Cheap to clone; all clones talk to the same writer thread. The thread
/// exits when the last clone is dropped.
#[derive(Clone)]
pub struct SqliteDriver {
    req_tx: mpsc::Sender<Request>,
}

impl SqliteDriver {
    /// Creates a fresh on-disk database for this startup of `service` and a
    /// driver wrapping it.
    ///
    /// The file path is
    /// `<user-cache>/libsdk/<service>/<service>-<uuidv7>.sqlite`, so each
    /// startup begins empty and rebuilds from the log.
    pub fn new(service: &str) -> Result<Self> {
        let path = db_path(service)?;
        Self::open_at(&path)
    }

    /// Opens (or creates) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let driver = Self::spawn(conn)?;

        info!(file = %path.display(), "database created");

        Ok(driver)
    }

    /// Creates a driver over an in-memory database. Primarily for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::spawn(conn)
    }

    /// Configures the connection and hands it to a dedicated writer thread.
    fn spawn(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode = WAL")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL")?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let (req_tx, req_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

        thread::Builder::new()
            .name("libsdk-sqlite-writer".to_string())
            .spawn(move || run_writer(conn, req_rx))?;

        Ok(Self { req_tx })
    }
}

#[async_trait]
impl Driver for SqliteDriver {
    async fn migrate(&self, statements: &[String]) -> Result<()> {
        let (resp, rx) = oneshot::channel();

        self.req_tx
            .send(Request::Migrate {
                statements: statements.to_vec(),
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }

    async fn exec(&self, record: TxRecord, handler: TxHandler) -> Result<ExecOutcome> {
        let (resp, rx) = oneshot::channel();

        self.req_tx
            .send(Request::Exec {
                record,
                handler,
                resp,
            })
            .await
            .map_err(|_| Error::Closed)?;

        rx.await.map_err(|_| Error::Closed)?
    }
}

/// The writer loop. Owns the connection for the life of the driver.
fn run_writer(mut conn: Connection, mut rx: mpsc::Receiver<Request>) {
    while let Some(request) = rx.blocking_recv() {
        match request {
            Request::Migrate { statements, resp } => {
                let _ = resp.send(migrate_on(&mut conn, &statements));
            }
            Request::Exec {
                record,
                handler,
                resp,
            } => {
                let _ = resp.send(exec_on(&mut conn, record, handler));
            }
        }
    }
}

/// Runs all migration statements in one transaction; all or nothing.
fn migrate_on(conn: &mut Connection, statements: &[String]) -> Result<()> {
    let tx = conn.transaction()?;

    for (index, statement) in statements.iter().enumerate() {
        info!(num = index + 1, of = statements.len(), "running migration");

        tx.execute_batch(statement).map_err(|err| Error::Migration {
            index,
            source: Box::new(err.into()),
        })?;
    }

    tx.commit()?;

    Ok(())
}

/// Runs one handler inside one transaction, committing or rolling back.
fn exec_on(conn: &mut Connection, record: TxRecord, handler: TxHandler) -> Result<ExecOutcome> {
    debug!(name = %record.name, uuid = %record.uuid, "exec");

    let tx = conn.transaction()?;
    let handle = SqliteTx {
        tx,
        did_write: Cell::new(false),
    };

    // A panicking handler must not take the writer thread (and every future
    // transaction) down with it; unwinds become HandlerPanic and the
    // transaction rolls back like any other failure.
    let outcome = catch_unwind(AssertUnwindSafe(|| handler(&handle, &record.args)));

    let did_write = handle.did_write.get();
    let tx = handle.tx;

    match outcome {
        Ok(Ok(result)) => {
            tx.commit()?;
            Ok(ExecOutcome { result, did_write })
        }
        Ok(Err(handler_err)) => match tx.rollback() {
            Ok(()) => Err(Error::Handler {
                name: record.name,
                source: Box::new(handler_err),
            }),
            Err(rollback_err) => Err(Error::Rollback {
                handler: handler_err.to_string(),
                source: Box::new(rollback_err.into()),
            }),
        },
        Err(_) => {
            let _ = tx.rollback();
            Err(Error::HandlerPanic { name: record.name })
        }
    }
}

// =============================================================================
// Transaction Handle
// =============================================================================

/// The per-invocation transaction handle handed to handlers.
struct SqliteTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
    did_write: Cell<bool>,
}

impl Tx for SqliteTx<'_> {
    fn read(&self) -> &dyn ReadTx {
        self
    }

    fn read_write(&self) -> &dyn ReadWriteTx {
        // Sticky: once a handler has asked for the write view, the record
        // replicates even if it never ends up executing a statement.
        self.did_write.set(true);
        self
    }

    fn did_write(&self) -> bool {
        self.did_write.get()
    }
}

impl ReadTx for SqliteTx<'_> {
    fn get(&self, query: &str, params: &[Value]) -> Result<Value> {
        let mut stmt = self.tx.prepare(query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(params_from_iter(bind_params(params)))?;
        match rows.next()? {
            Some(row) => row_to_object(&columns, row),
            None => Err(Error::Sqlite(rusqlite::Error::QueryReturnedNoRows)),
        }
    }

    fn select(&self, query: &str, params: &[Value]) -> Result<Vec<Value>> {
        let mut stmt = self.tx.prepare(query)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut out = Vec::new();
        let mut rows = stmt.query(params_from_iter(bind_params(params)))?;
        while let Some(row) = rows.next()? {
            out.push(row_to_object(&columns, row)?);
        }

        Ok(out)
    }
}

impl ReadWriteTx for SqliteTx<'_> {
    fn exec(&self, query: &str, params: &[Value]) -> Result<i64> {
        self.tx.execute(query, params_from_iter(bind_params(params)))?;
        Ok(self.tx.last_insert_rowid())
    }

    fn delete(&self, query: &str, params: &[Value]) -> Result<()> {
        self.tx.execute(query, params_from_iter(bind_params(params)))?;
        Ok(())
    }
}

// =============================================================================
// JSON <-> SQL Value Mapping
// =============================================================================

/// Maps JSON argument values onto SQLite parameter values.
///
/// Nested arrays and objects are bound as their JSON text; storing structured
/// values in TEXT columns keeps them replicable without a side channel.
fn bind_params(params: &[Value]) -> Vec<rusqlite::types::Value> {
    params
        .iter()
        .map(|value| match value {
            Value::Null => rusqlite::types::Value::Null,
            Value::Bool(b) => rusqlite::types::Value::Integer(*b as i64),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    rusqlite::types::Value::Integer(i)
                } else {
                    rusqlite::types::Value::Real(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => rusqlite::types::Value::Text(s.clone()),
            other => rusqlite::types::Value::Text(other.to_string()),
        })
        .collect()
}

/// Reads one row into a JSON object keyed by column name.
fn row_to_object(columns: &[String], row: &rusqlite::Row<'_>) -> Result<Value> {
    let mut object = serde_json::Map::with_capacity(columns.len());

    for (index, column) in columns.iter().enumerate() {
        let value = match row.get_ref(index)? {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(n) => Value::from(n),
            ValueRef::Real(f) => Value::from(f),
            ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Blob(blob) => Value::Array(blob.iter().map(|b| Value::from(*b)).collect()),
        };

        object.insert(column.clone(), value);
    }

    Ok(Value::Object(object))
}

/// Computes the fresh per-startup database path for a service.
fn db_path(service: &str) -> Result<PathBuf> {
    let cache = dirs::cache_dir().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no user cache directory",
        ))
    })?;

    let folder = cache.join("libsdk").join(service);
    std::fs::create_dir_all(&folder)?;

    // Each startup recreates the db from scratch by replaying the log, so
    // each startup gets a fresh file.
    Ok(folder.join(format!("{}-{}.sqlite", service, Uuid::now_v7())))
}

// =============================================================================
// Tests
// =============================================================================
