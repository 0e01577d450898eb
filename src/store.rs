//! # The Replicated Store
//!
//! A distributed, replicated datastore for libsdk services. Ground truth is
//! the ordered log of [`TxRecord`]s on the fabric; the local database is a
//! pure function of the log prefix consumed so far plus the ordered
//! migrations, and never outlives the process.
//!
//! ## Write path
//!
//! ```text
//!  exec("InsertPerson", args)
//!       │
//!       ▼
//!  ┌─────────────┐   commit   ┌──────────────┐   publish   ┌───────────┐
//!  │ run handler ├───────────►│ in-flight map├────────────►│  fabric   │
//!  │  locally    │            │ uuid → echo  │             │   log     │
//!  └─────────────┘            └──────▲───────┘             └─────┬─────┘
//!       │ read-only? return          │ fire echo, no re-apply    │
//!       ▼                            │                           ▼
//!   result ◄─────────── await echo ──┴──────────────────── apply loop
//! ```
//!
//! Applying locally first lets the handler produce a result (say, a last
//! insert id) and catches deterministic failures such as constraint
//! violations before they pollute the log. Publishing after local success is
//! the replication commit point. Awaiting the echo turns publish-acceptance
//! into a happens-before edge: once `exec` returns, the apply loop has
//! processed the record, so any subsequent read on this instance observes
//! the write.
//!
//! ## Apply loop
//!
//! One dedicated task owns the log cursor and applies records strictly in
//! log order; record application is never fanned out. For each record: if its
//! UUID sits in the in-flight map the record is the echo of a local write
//! (fire the signal, do not re-apply); otherwise it is a peer's write (or
//! history during a fresh boot) and is applied through the registered
//! handler.
//!
//! ## States
//!
//! `NEW → MIGRATED → REPLAYING → READY (→ CLOSED)`. Registration is valid
//! only in NEW; `start` advances to READY; `exec` is valid only in READY.
//! The apply loop runs from REPLAYING until close.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::driver::{Driver, Tx, TxHandler};
use crate::error::{Error, Result};
use crate::fabric::{Delivery, Replay, ReplayConnection};
use crate::record::TxRecord;

/// How long the write path waits for its record's echo before giving up.
pub const DEFAULT_REPLICATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunables for a [`Store`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Deadline for observing a published record's echo. On expiry `exec`
    /// returns [`Error::ReplicationTimeout`] and the outcome is
    /// indeterminate: background replay may still apply the record later.
    pub replication_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            replication_timeout: DEFAULT_REPLICATION_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    New,
    Migrated,
    Replaying,
    Ready,
    Closed,
}

/// The replicated, log-backed transactional store.
///
/// Cheap to clone; clones share the registry, the in-flight map, and the
/// apply loop. `exec` may be called concurrently from many tasks.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Box<dyn Driver>,
    replayer: Box<dyn ReplayConnection>,
    registry: RwLock<HashMap<String, TxHandler>>,
    inflight: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    state: Mutex<State>,
    apply_task: Mutex<Option<JoinHandle<()>>>,
    config: StoreConfig,
}

impl Store {
    /// Creates a store over a driver and a log channel.
    pub fn new(driver: impl Driver, replayer: impl ReplayConnection + 'static) -> Self {
        Self::with_config(driver, replayer, StoreConfig::default())
    }

    /// Creates a store with explicit configuration.
    pub fn with_config(
        driver: impl Driver,
        replayer: impl ReplayConnection + 'static,
        config: StoreConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver: Box::new(driver),
                replayer: Box::new(replayer),
                registry: RwLock::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                state: Mutex::new(State::New),
                apply_task: Mutex::new(None),
                config,
            }),
        }
    }

    /// Registers a transaction handler under a unique name.
    ///
    /// Names must be non-empty and unique; all registration happens before
    /// [`start`](Store::start).
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyName`] for an empty name
    /// - [`Error::AlreadyRegistered`] if the name is taken
    /// - [`Error::AlreadyStarted`] once the store has started
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&dyn Tx, &[Value]) -> Result<Value> + Send + Sync + 'static,
    ) -> Result<()> {
        self.register_handler(name, Arc::new(handler))
    }

    /// Registers an already-built [`TxHandler`] under a unique name.
    ///
    /// Same rules as [`register`](Store::register); useful when handlers are
    /// collected in a table first, as the service shell does.
    pub fn register_handler(&self, name: impl Into<String>, handler: TxHandler) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::EmptyName);
        }

        if *self.inner.state.lock().unwrap() != State::New {
            return Err(Error::AlreadyStarted);
        }

        let mut registry = self.inner.registry.write().unwrap();
        if registry.contains_key(&name) {
            return Err(Error::AlreadyRegistered { name });
        }

        registry.insert(name, handler);

        Ok(())
    }

    /// Migrates the local database, attaches to the log from its beginning,
    /// and blocks until replay has caught up to attach time.
    ///
    /// After `start` returns the store is READY: every record present in the
    /// log at attach time is visible through reads, and the apply loop keeps
    /// running in the background for the life of the store.
    ///
    /// # Errors
    ///
    /// - [`Error::Migration`] if any migration statement fails (fail-fast)
    /// - [`Error::AlreadyStarted`] on a second call
    /// - attach failures from the log channel
    pub async fn start(&self, migrations: &[String]) -> Result<()> {
        match *self.inner.state.lock().unwrap() {
            State::New => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::AlreadyStarted),
        }

        self.inner.driver.migrate(migrations).await?;
        self.set_state(State::Migrated);

        let Replay {
            deliveries,
            mut caught_up,
        } = self.inner.replayer.replay().await?;
        self.set_state(State::Replaying);

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(apply_loop(inner, deliveries));
        *self.inner.apply_task.lock().unwrap() = Some(task);

        // Replay continues async after the latch fires, but once it does the
        // db has every attach-time record and is ready for queries.
        caught_up.wait().await;
        self.set_state(State::Ready);

        Ok(())
    }

    /// Performs a two-stage distributed transaction through a registered
    /// handler.
    ///
    /// The handler runs in a local transaction first. If it never took the
    /// read-write view the result returns immediately: read-only
    /// transactions are not replicated. Otherwise the record is published to
    /// the log and `exec` waits for its echo; a non-errored return
    /// guarantees replication succeeded.
    ///
    /// # Errors
    ///
    /// - [`Error::NotRegistered`] for an unknown name
    /// - [`Error::Handler`] / [`Error::HandlerPanic`]: rolled back locally,
    ///   never published
    /// - [`Error::Publish`]: local commit succeeded but the log refused the
    ///   record: a critical inconsistency, stop writing until restart
    /// - [`Error::ReplicationTimeout`]: echo not observed in time; outcome
    ///   indeterminate
    pub async fn exec(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match *self.inner.state.lock().unwrap() {
            State::Ready => {}
            State::Closed => return Err(Error::Closed),
            _ => return Err(Error::NotReady),
        }

        let handler = self
            .inner
            .registry
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotRegistered {
                name: name.to_string(),
            })?;

        let record = TxRecord::new(name, args);

        // The driver commits or rolls back internally; the outcome tells us
        // whether there is anything to distribute.
        let outcome = self.inner.driver.exec(record.clone(), handler).await?;

        if !outcome.did_write {
            return Ok(outcome.result);
        }

        let payload = record.to_bytes()?;

        let (echo_tx, echo_rx) = oneshot::channel();
        self.inner
            .inflight
            .lock()
            .unwrap()
            .insert(record.uuid, echo_tx);

        if let Err(err) = self.inner.replayer.publish(payload).await {
            self.inner.inflight.lock().unwrap().remove(&record.uuid);
            return Err(Error::Publish {
                source: Box::new(err),
            });
        }

        match tokio::time::timeout(self.inner.config.replication_timeout, echo_rx).await {
            Ok(Ok(())) => Ok(outcome.result),
            Ok(Err(_)) => Err(Error::Closed),
            // The in-flight entry stays behind: a late echo must complete
            // against it instead of re-applying a write that already
            // committed locally.
            Err(_) => Err(Error::ReplicationTimeout { uuid: record.uuid }),
        }
    }

    /// Closes the store: stops the apply loop and rejects further calls.
    pub fn close(&self) {
        self.set_state(State::Closed);

        if let Some(task) = self.inner.apply_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn set_state(&self, state: State) {
        *self.inner.state.lock().unwrap() = state;
    }
}

/// The apply loop: consumes the log in order on one dedicated task.
async fn apply_loop(inner: Arc<Inner>, mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        apply_one(&inner, &delivery).await;
        delivery.ack();
    }
}

async fn apply_one(inner: &Inner, delivery: &Delivery) {
    let record = match TxRecord::from_bytes(delivery.payload()) {
        Ok(record) => record,
        Err(err) => {
            // Ack-and-skip: a poison message must not stall replay. The
            // write path's idempotency does not depend on this message.
            warn!(error = %err, "skipping undecodable log message");
            return;
        }
    };

    debug!(uuid = %record.uuid, name = %record.name, "replaying transaction");

    let handler = inner.registry.read().unwrap().get(&record.name).cloned();
    let Some(handler) = handler else {
        // Other services on the same log may register handlers this one
        // does not.
        warn!(name = %record.name, "transaction is not registered; dropping record");
        return;
    };

    let completion = inner.inflight.lock().unwrap().remove(&record.uuid);
    if let Some(completion) = completion {
        // Echo of a locally originated write: the driver already committed
        // it in the write path. Signal completion and do not re-apply.
        let _ = completion.send(());
        return;
    }

    if let Err(err) = inner.driver.exec(record.clone(), handler).await {
        error!(
            uuid = %record.uuid,
            name = %record.name,
            error = %err,
            "failed to apply replayed transaction"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver_sqlite::SqliteDriver;
    use crate::fabric::{Fabric, ReplayPolicy};
    use crate::fabric_memory::MemoryFabric;
    use serde_json::json;

    const MIGRATION: &str = "CREATE TABLE people (
        person_id INTEGER PRIMARY KEY,
        first_name TEXT NOT NULL,
        email TEXT NOT NULL UNIQUE
    )";

    fn store_over(fabric: &MemoryFabric) -> Store {
        let driver = SqliteDriver::open_in_memory().unwrap();
        let replayer = fabric.replayer("store", ReplayPolicy::FromBeginning).unwrap();
        Store::with_config(
            driver,
            replayer,
            StoreConfig {
                replication_timeout: Duration::from_secs(5),
            },
        )
    }

    fn register_people(store: &Store) {
        store
            .register("InsertPerson", |tx, args| {
                let id = tx.read_write().exec(
                    "INSERT INTO people (first_name, email) VALUES (?1, ?2)",
                    args,
                )?;
                Ok(json!(id))
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_register_rejects_empty_and_duplicate_names() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);

        assert!(matches!(
            store.register("", |_, _| Ok(Value::Null)),
            Err(Error::EmptyName)
        ));

        store.register("A", |_, _| Ok(Value::Null)).unwrap();
        assert!(matches!(
            store.register("A", |_, _| Ok(Value::Null)),
            Err(Error::AlreadyRegistered { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_after_start_fails() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);
        register_people(&store);

        store.start(&[MIGRATION.to_string()]).await.unwrap();

        assert!(matches!(
            store.register("Late", |_, _| Ok(Value::Null)),
            Err(Error::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_exec_requires_ready() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);
        register_people(&store);

        let err = store.exec("InsertPerson", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }

    #[tokio::test]
    async fn test_exec_unregistered_name() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);
        register_people(&store);
        store.start(&[MIGRATION.to_string()]).await.unwrap();

        let err = store.exec("Nope", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);
        register_people(&store);

        store.start(&[MIGRATION.to_string()]).await.unwrap();
        let err = store.start(&[]).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyStarted));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_exec() {
        let fabric = MemoryFabric::new();
        let store = store_over(&fabric);
        register_people(&store);
        store.start(&[MIGRATION.to_string()]).await.unwrap();

        store.close();

        let err = store
            .exec("InsertPerson", vec![json!("Rick"), json!("r@x")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
