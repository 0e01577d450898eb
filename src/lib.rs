//! # libsdk - Replicated Service Toolkit
//!
//! libsdk is a small service-development kit whose core is a **replicated,
//! log-backed transactional store**. Each service instance owns a fresh
//! local SQLite database; the ground truth of state is a durable, ordered
//! stream of write-transaction records on a shared messaging fabric.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Service Shell                            │
//! │            (wire up, migrate, replay, then serve)               │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Store                                 │
//! │      (registry, write path, in-flight map, apply loop)          │
//! │                                                                 │
//! │   exec: run locally ─► publish record ─► await echo             │
//! │   apply loop: replay log in order into the local db             │
//! └───────────┬─────────────────────────────────────┬───────────────┘
//!             │                                     │
//!             ▼                                     ▼
//! ┌───────────────────────┐             ┌───────────────────────────┐
//! │     SQLite Driver     │             │       Fabric Log          │
//! │  (fresh db per boot,  │             │  (durable ordered stream, │
//! │   WAL, one writer     │             │   caught-up latch,        │
//! │   thread)             │             │   per-message acks)       │
//! └───────────────────────┘             └───────────────────────────┘
//! ```
//!
//! A service is brought up by replaying the stream into a freshly migrated
//! local database. Thereafter, any write is first appended to the shared
//! log, then applied locally only after the service observes its own record
//! coming back through the log. Reads run entirely against the local
//! replica.
//!
//! ## Core Invariants
//!
//! 1. A record observed by the apply loop either originated locally (present
//!    in the in-flight map: fire the echo signal, never re-apply) or
//!    elsewhere (apply via the registered handler).
//! 2. The on-disk database is a pure function of the consumed log prefix
//!    plus the ordered migrations.
//! 3. A successful return from `exec` implies the record was durably
//!    accepted by the log.
//! 4. Local database contents survive no longer than the process; identity
//!    of state lives only in the log.
//!
//! ## Example
//!
//! ```rust,ignore
//! use libsdk::{Service, SimpleApp, Store, TxHandler};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> libsdk::Result<()> {
//!     libsdk::init_logging();
//!
//!     let insert: TxHandler = Arc::new(|tx, args| {
//!         let id = tx.read_write().exec(
//!             "INSERT INTO people (first_name, last_name, email) VALUES (?1, ?2, ?3)",
//!             args,
//!         )?;
//!         Ok(json!(id))
//!     });
//!
//!     let app = SimpleApp::new(
//!         vec!["CREATE TABLE people (
//!             person_id INTEGER PRIMARY KEY,
//!             first_name TEXT NOT NULL,
//!             last_name TEXT NOT NULL,
//!             email TEXT NOT NULL UNIQUE
//!         )".to_string()],
//!         vec![("InsertPerson".to_string(), insert)],
//!         |store: Store| async move {
//!             let id = store
//!                 .exec("InsertPerson", vec![json!("Rick"), json!("Sanchez"), json!("r@x")])
//!                 .await?;
//!             println!("inserted person {id}");
//!             Ok(())
//!         },
//!     );
//!
//!     Service::new("personsvc")?.serve(app).await
//! }
//! ```

/// Error types for all libsdk operations.
pub mod error;

/// Transaction records: the unit of replication, plus argument narrowing.
pub mod record;

/// The driver contract: how the store talks to a local SQL engine.
pub mod driver;

/// SQLite reference driver: fresh per-startup database, WAL, one writer
/// thread.
pub mod driver_sqlite;

/// The fabric log contract: ordered durable publish/replay with a caught-up
/// latch and per-message acks.
pub mod fabric;

/// File-backed fabric reference implementation: a per-service stream in a
/// shared SQLite file.
pub mod fabric_sqlite;

/// In-process fabric for tests and single-process setups; supports pausing
/// delivery to simulate a stalled fabric.
pub mod fabric_memory;

/// The store: transaction registry, write path, in-flight tracking, and the
/// replay-driven apply loop.
pub mod store;

/// The service shell: wiring, lifecycle, and the `App` trait.
pub mod service;

pub use driver::{Driver, ExecOutcome, ReadTx, ReadWriteTx, Tx, TxHandler};
pub use driver_sqlite::SqliteDriver;
pub use error::{Error, Result};
pub use fabric::{CaughtUp, Delivery, Fabric, Replay, ReplayConnection, ReplayPolicy};
pub use fabric_memory::MemoryFabric;
pub use fabric_sqlite::{FabricConfig, SqliteFabric};
pub use record::TxRecord;
pub use service::{init_logging, public_addr, App, Service, SimpleApp};
pub use store::{Store, StoreConfig, DEFAULT_REPLICATION_TIMEOUT};
