//! # File-Backed Fabric
//!
//! Reference implementation of the [`Fabric`] log contract: a durable,
//! per-service stream stored as a single SQLite file in a shared data
//! directory. The semantics mirror a JetStream-style broker (named stream
//! per service, subject-scoped total order, disposable per-attach consumers,
//! `num_pending`-based caught-up accounting, explicit acks, limits-based
//! retention) without requiring a broker process: instances on the same
//! host replicate through the shared file via SQLite's WAL mode.
//!
//! ## Layout
//!
//! One stream per service, named after the service, at
//! `<data-dir>/<service>.stream`. The data directory comes from
//! `LIBSDK_FABRIC_DATA_DIR`, defaulting to `<user-cache>/libsdk/fabric`.
//! The stream carries the subjects `<svc>.store` (used by the store) and
//! `<svc>.pub` (reserved for application broadcast).
//!
//! ## Consumers
//!
//! Every [`replay`](SqliteReplayConnection::replay) attaches a fresh
//! consumer with its own cursor and a unique identity, so each process (and
//! each attach within a process) reads independently. A consumer counts the
//! messages that existed at attach time (`num_pending`) and fires its
//! caught-up latch exactly once, after that many messages have been
//! delivered *and acknowledged*, or immediately if the subject was empty.
//!
//! ## Delivery discipline
//!
//! One message at a time, in order, ack-gated: the consumer does not hand
//! out message N+1 until message N is acked. A delivery dropped without ack
//! is redelivered; an acked message is never redelivered to that consumer.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fabric::{CaughtUp, Delivery, Fabric, Replay, ReplayConnection, ReplayPolicy};

/// Environment variable naming the shared fabric data directory.
pub const FABRIC_DATA_DIR_ENV: &str = "LIBSDK_FABRIC_DATA_DIR";

/// Default retention cap for a stream: 32 GB.
pub const DEFAULT_MAX_BYTES: u64 = 32_000_000_000;

/// Default interval at which consumers poll the stream for new messages.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(15);

/// How many messages a consumer fetches per poll.
const FETCH_BATCH: usize = 64;

/// How long a connection waits on a locked stream file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The `messages` table is the stream itself: one row per published
/// message, for every subject of the service.
///
/// # Columns
///
/// - `seq`: Auto-increment primary key; the stream's total order. Consumer
///   cursors are `seq` values, and `seq > cursor` is the whole replay
///   protocol.
/// - `subject`: Full subject string (e.g. `personsvc.store`). Stored per
///   row rather than normalized into a side table; a stream has two or
///   three subjects, so the dedup would buy nothing.
/// - `payload`: The message bytes, opaque to the fabric. The store puts
///   JSON transaction records here, but nothing in this layer assumes so.
/// - `published_ms`: Unix milliseconds at insert time. Diagnostic only;
///   ordering always comes from `seq`, never from clocks.
///
/// # Why AUTOINCREMENT?
///
/// Plain `INTEGER PRIMARY KEY` reuses rowids after deletes. Retention
/// deletes old rows, and a reused `seq` would re-deliver under a cursor
/// that already passed it. AUTOINCREMENT guarantees `seq` never repeats
/// for the life of the stream.
const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    subject      TEXT NOT NULL,
    payload      BLOB NOT NULL,
    published_ms INTEGER NOT NULL
)
"#;

/// Index powering the consumer poll query.
///
/// Consumers fetch with `WHERE subject = ? AND seq > ? ORDER BY seq`;
/// `(subject, seq)` answers that with a single range scan, so an idle
/// consumer's poll touches only the index tail instead of the table.
const CREATE_MESSAGES_SUBJECT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS messages_subject
ON messages(subject, seq)
"#;

/// The `stream_config` table records the stream's configuration, as a
/// broker would carry it in stream metadata.
///
/// # Columns
///
/// - `key`: Configuration key. Currently `name` (the service the stream
///   belongs to), `subjects` (comma-separated persisted subjects), and
///   `max_bytes` (the retention cap).
/// - `value`: The configuration value, as text.
///
/// # Why Key-Value?
///
/// Connecting is create-*or-update*: a reconnect with new settings
/// replaces individual keys without a schema migration, and tooling can
/// inspect a stream file with one query. A fixed-column table would need
/// ALTERs every time a setting is added.
const CREATE_STREAM_CONFIG: &str = r#"
CREATE TABLE IF NOT EXISTS stream_config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Configuration for a file-backed fabric.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Shared directory holding the stream files. `None` resolves the
    /// environment variable and then the user cache directory.
    pub data_dir: Option<PathBuf>,

    /// Retention cap for the stream; oldest messages are dropped past it.
    pub max_bytes: u64,

    /// How often consumers poll for new messages.
    pub poll_interval: Duration,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_bytes: DEFAULT_MAX_BYTES,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// A publish request served by the publisher thread.
struct PublishRequest {
    subject: String,
    payload: Vec<u8>,
    resp: oneshot::Sender<Result<()>>,
}

/// File-backed [`Fabric`] for a single service.
pub struct SqliteFabric {
    service: String,
    path: PathBuf,
    poll_interval: Duration,
    publish_tx: mpsc::Sender<PublishRequest>,
}

impl SqliteFabric {
    /// Creates or updates the stream for `service` and connects to it.
    pub fn connect(service: &str) -> Result<Self> {
        Self::connect_with(service, FabricConfig::default())
    }

    /// Creates or updates the stream for `service` with explicit config.
    pub fn connect_with(service: &str, config: FabricConfig) -> Result<Self> {
        let dir = match &config.data_dir {
            Some(dir) => dir.clone(),
            None => default_data_dir()?,
        };
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("{}.stream", service));

        let conn = open_stream(&path)?;
        ensure_stream(&conn, service, config.max_bytes)?;

        let (publish_tx, publish_rx) = mpsc::channel(256);
        let max_bytes = config.max_bytes;
        thread::Builder::new()
            .name("libsdk-fabric-publisher".to_string())
            .spawn(move || run_publisher(conn, publish_rx, max_bytes))?;

        Ok(Self {
            service: service.to_string(),
            path,
            poll_interval: config.poll_interval,
            publish_tx,
        })
    }

    /// The stream file backing this fabric.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Fabric for SqliteFabric {
    fn replayer(&self, subject: &str, policy: ReplayPolicy) -> Result<Box<dyn ReplayConnection>> {
        Ok(Box::new(SqliteReplayConnection {
            subject: format!("{}.{}", self.service, subject),
            path: self.path.clone(),
            policy,
            poll_interval: self.poll_interval,
            publish_tx: self.publish_tx.clone(),
        }))
    }
}

/// A publish/replay connection on one subject of a file-backed stream.
pub struct SqliteReplayConnection {
    subject: String,
    path: PathBuf,
    policy: ReplayPolicy,
    poll_interval: Duration,
    publish_tx: mpsc::Sender<PublishRequest>,
}

#[async_trait]
impl ReplayConnection for SqliteReplayConnection {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        let (resp, rx) = oneshot::channel();

        self.publish_tx
            .send(PublishRequest {
                subject: self.subject.clone(),
                payload,
                resp,
            })
            .await
            .map_err(|_| Error::Fabric("publisher has shut down".to_string()))?;

        rx.await
            .map_err(|_| Error::Fabric("publisher dropped the response".to_string()))?
    }

    async fn replay(&self) -> Result<Replay> {
        let conn = open_stream(&self.path)?;

        // Attach-time accounting: the cursor decides what this consumer will
        // see, num_pending decides when it is caught up.
        let (cursor, num_pending) = match self.policy {
            ReplayPolicy::FromBeginning => {
                let pending: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM messages WHERE subject = ?1",
                    [&self.subject],
                    |row| row.get(0),
                )?;
                (0i64, pending)
            }
            ReplayPolicy::NewOnly => {
                let tail: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) FROM messages WHERE subject = ?1",
                    [&self.subject],
                    |row| row.get(0),
                )?;
                (tail, 0)
            }
        };

        // Consumers are disposable: each attach gets its own identity and
        // cursor, even within a single process.
        let consumer = format!("consumer-{}", Uuid::now_v7());
        debug!(
            subject = %self.subject,
            consumer = %consumer,
            cursor,
            num_pending,
            "consumer attached"
        );

        let (deliveries_tx, deliveries_rx) = mpsc::channel(1);
        let (latch_tx, caught_up) = CaughtUp::latch();

        let subject = self.subject.clone();
        let poll_interval = self.poll_interval;
        thread::Builder::new()
            .name("libsdk-fabric-consumer".to_string())
            .spawn(move || {
                run_consumer(
                    conn,
                    subject,
                    cursor,
                    num_pending,
                    deliveries_tx,
                    latch_tx,
                    poll_interval,
                )
            })?;

        Ok(Replay {
            deliveries: deliveries_rx,
            caught_up,
        })
    }
}

// =============================================================================
// Worker Threads
// =============================================================================

/// The publisher loop. Owns the write connection; an insert is acknowledged
/// to the caller only after it has committed.
fn run_publisher(
    conn: Connection,
    mut rx: mpsc::Receiver<PublishRequest>,
    max_bytes: u64,
) {
    while let Some(request) = rx.blocking_recv() {
        let result = store_message(&conn, &request.subject, &request.payload, max_bytes);
        let _ = request.resp.send(result);
    }
}

fn store_message(conn: &Connection, subject: &str, payload: &[u8], max_bytes: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (subject, payload, published_ms) VALUES (?1, ?2, ?3)",
        rusqlite::params![subject, payload, now_ms()],
    )?;

    enforce_retention(conn, max_bytes)?;

    Ok(())
}

/// Limits-based retention: drop oldest messages while over the cap.
fn enforce_retention(conn: &Connection, max_bytes: u64) -> Result<()> {
    loop {
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM messages",
            [],
            |row| row.get(0),
        )?;

        if total <= 0 || (total as u64) <= max_bytes {
            return Ok(());
        }

        conn.execute(
            "DELETE FROM messages WHERE seq = (SELECT MIN(seq) FROM messages)",
            [],
        )?;
    }
}

/// The consumer loop: poll, deliver one message at a time, wait for its ack,
/// advance the cursor. Exits when the replay's receiver is dropped.
fn run_consumer(
    conn: Connection,
    subject: String,
    mut cursor: i64,
    num_pending: u64,
    deliveries_tx: mpsc::Sender<Delivery>,
    latch_tx: oneshot::Sender<()>,
    poll_interval: Duration,
) {
    let mut latch = Some(latch_tx);
    let mut acked: u64 = 0;

    // First attach to an empty subject: caught up before anything arrives.
    if num_pending == 0 {
        fire(&mut latch);
    }

    loop {
        let batch = match fetch_batch(&conn, &subject, cursor) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(subject = %subject, error = %err, "failed to fetch messages");
                thread::sleep(poll_interval);
                continue;
            }
        };

        if batch.is_empty() {
            if deliveries_tx.is_closed() {
                return;
            }
            thread::sleep(poll_interval);
            continue;
        }

        for (seq, payload) in batch {
            // Ack-gated: redeliver until acked, never deliver past an
            // unacked message.
            loop {
                let (ack_tx, ack_rx) = oneshot::channel();
                let delivery = Delivery::new(payload.clone(), ack_tx);

                if deliveries_tx.blocking_send(delivery).is_err() {
                    return;
                }

                match ack_rx.blocking_recv() {
                    Ok(()) => break,
                    Err(_) => {
                        if deliveries_tx.is_closed() {
                            return;
                        }
                        warn!(subject = %subject, seq, "delivery dropped without ack; redelivering");
                    }
                }
            }

            cursor = seq;
            acked += 1;
            if acked >= num_pending {
                fire(&mut latch);
            }
        }
    }
}

fn fire(latch: &mut Option<oneshot::Sender<()>>) {
    if let Some(latch) = latch.take() {
        let _ = latch.send(());
    }
}

fn fetch_batch(conn: &Connection, subject: &str, cursor: i64) -> Result<Vec<(i64, Vec<u8>)>> {
    let mut stmt = conn.prepare(
        "SELECT seq, payload FROM messages
         WHERE subject = ?1 AND seq > ?2
         ORDER BY seq
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(
        rusqlite::params![subject, cursor, FETCH_BATCH as i64],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?)),
    )?;

    let mut batch = Vec::new();
    for row in rows {
        batch.push(row?);
    }

    Ok(batch)
}

// =============================================================================
// Stream File
// =============================================================================

fn open_stream(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Creates or updates the stream: schema plus its recorded configuration.
fn ensure_stream(conn: &Connection, service: &str, max_bytes: u64) -> Result<()> {
    conn.execute_batch(CREATE_MESSAGES)?;
    conn.execute_batch(CREATE_MESSAGES_SUBJECT_INDEX)?;
    conn.execute_batch(CREATE_STREAM_CONFIG)?;

    // SERVICE.store and SERVICE.pub are the persisted subjects; .store is
    // used by the store, .pub is reserved for application broadcast.
    let subjects = format!("{0}.store,{0}.pub", service);

    conn.execute(
        "INSERT OR REPLACE INTO stream_config (key, value) VALUES ('name', ?1)",
        [service],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO stream_config (key, value) VALUES ('subjects', ?1)",
        [&subjects],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO stream_config (key, value) VALUES ('max_bytes', ?1)",
        [max_bytes.to_string()],
    )?;

    Ok(())
}

fn default_data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(FABRIC_DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let cache = dirs::cache_dir().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no user cache directory",
        ))
    })?;

    Ok(cache.join("libsdk").join("fabric"))
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
