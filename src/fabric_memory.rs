//! # In-Process Fabric
//!
//! An in-memory implementation of the [`Fabric`] log contract for tests and
//! single-process setups. It honors the full stream semantics (subject
//! order, disposable per-attach consumers, `num_pending` caught-up
//! accounting, ack-gated delivery with redelivery of unacked messages) but
//! the log lives on the heap and dies with the process.
//!
//! The fabric can be [`pause`](MemoryFabric::pause)d: publishes are still
//! accepted durably, but no consumer receives anything until
//! [`resume`](MemoryFabric::resume). That simulates a stalled or partitioned
//! fabric for exercising replication timeouts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::Result;
use crate::fabric::{CaughtUp, Delivery, Fabric, Replay, ReplayConnection, ReplayPolicy};

/// How often idle in-memory consumers look for new messages.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

struct MemoryInner {
    subjects: Mutex<HashMap<String, Vec<Arc<Vec<u8>>>>>,
    paused: AtomicBool,
}

/// In-process [`Fabric`]. Cheap to clone; clones share the log.
#[derive(Clone)]
pub struct MemoryFabric {
    inner: Arc<MemoryInner>,
}

impl MemoryFabric {
    /// Creates an empty in-process fabric.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                subjects: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
            }),
        }
    }

    /// Stops delivering to consumers. Publishes are still accepted.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes delivery after a [`pause`](MemoryFabric::pause).
    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Number of messages held on a subject. Subjects here are unscoped
    /// names as passed to [`replayer`](Fabric::replayer).
    pub fn message_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .lock()
            .unwrap()
            .get(subject)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for MemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl Fabric for MemoryFabric {
    fn replayer(&self, subject: &str, policy: ReplayPolicy) -> Result<Box<dyn ReplayConnection>> {
        Ok(Box::new(MemoryReplayConnection {
            subject: subject.to_string(),
            policy,
            inner: Arc::clone(&self.inner),
        }))
    }
}

/// A publish/replay connection on one subject of a [`MemoryFabric`].
pub struct MemoryReplayConnection {
    subject: String,
    policy: ReplayPolicy,
    inner: Arc<MemoryInner>,
}

#[async_trait]
impl ReplayConnection for MemoryReplayConnection {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        self.inner
            .subjects
            .lock()
            .unwrap()
            .entry(self.subject.clone())
            .or_default()
            .push(Arc::new(payload));

        Ok(())
    }

    async fn replay(&self) -> Result<Replay> {
        let (cursor, num_pending) = {
            let subjects = self.inner.subjects.lock().unwrap();
            let len = subjects.get(&self.subject).map(Vec::len).unwrap_or(0);
            match self.policy {
                ReplayPolicy::FromBeginning => (0, len as u64),
                ReplayPolicy::NewOnly => (len, 0),
            }
        };

        let (deliveries_tx, deliveries_rx) = mpsc::channel(1);
        let (latch_tx, caught_up) = CaughtUp::latch();

        tokio::spawn(run_consumer(
            Arc::clone(&self.inner),
            self.subject.clone(),
            cursor,
            num_pending,
            deliveries_tx,
            latch_tx,
        ));

        Ok(Replay {
            deliveries: deliveries_rx,
            caught_up,
        })
    }
}

async fn run_consumer(
    inner: Arc<MemoryInner>,
    subject: String,
    mut cursor: usize,
    num_pending: u64,
    deliveries_tx: mpsc::Sender<Delivery>,
    latch_tx: oneshot::Sender<()>,
) {
    let mut latch = Some(latch_tx);
    let mut acked: u64 = 0;

    if num_pending == 0 {
        fire(&mut latch);
    }

    loop {
        if inner.paused.load(Ordering::SeqCst) {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        let next = {
            let subjects = inner.subjects.lock().unwrap();
            subjects.get(&subject).and_then(|m| m.get(cursor).cloned())
        };

        let Some(payload) = next else {
            if deliveries_tx.is_closed() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        // Ack-gated, same discipline as the file-backed fabric: redeliver
        // until acked, never move past an unacked message.
        loop {
            let (ack_tx, ack_rx) = oneshot::channel();
            let delivery = Delivery::new(payload.as_ref().clone(), ack_tx);

            if deliveries_tx.send(delivery).await.is_err() {
                return;
            }

            match ack_rx.await {
                Ok(()) => break,
                Err(_) => {
                    if deliveries_tx.is_closed() {
                        return;
                    }
                    warn!(subject = %subject, cursor, "delivery dropped without ack; redelivering");
                }
            }
        }

        cursor += 1;
        acked += 1;
        if acked >= num_pending {
            fire(&mut latch);
        }
    }
}

fn fire(latch: &mut Option<oneshot::Sender<()>>) {
    if let Some(latch) = latch.take() {
        let _ = latch.send(());
    }
}
