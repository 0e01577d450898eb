//! # Fabric Log Contract
//!
//! The fabric is the shared messaging substrate that gives every service a
//! durable, totally ordered, replayable log. The store only ever needs one
//! capability from it: a [`ReplayConnection`] on a named subject, able to
//! publish payloads and to replay the subject's history with a well-defined
//! "caught up" signal.
//!
//! ## Stream semantics
//!
//! - Total order per subject; durable on disk; append-only within the
//!   configured retention limits.
//! - [`publish`](ReplayConnection::publish) blocks until the message has
//!   been durably accepted or fails.
//! - [`replay`](ReplayConnection::replay) attaches a fresh, disposable
//!   consumer with its own cursor and streams every message through as a
//!   [`Delivery`], one at a time, in order.
//! - The [`CaughtUp`] latch fires exactly once, when every message that
//!   existed at attach time has been delivered and acknowledged, or
//!   immediately, if the subject was empty at attach.
//!
//! ## Acknowledgement
//!
//! Delivery is at-least-once. Each message carries an explicit ack
//! ([`Delivery::ack`]); a delivery dropped without acking is delivered
//! again. Once acked, a message is never redelivered to that consumer, so a
//! receiver that acks after processing sees each message's effects applied
//! at most once.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

/// Where a new consumer starts reading a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayPolicy {
    /// Deliver the subject's entire history, then follow the tail.
    FromBeginning,

    /// Deliver only messages newer than attach time.
    NewOnly,
}

/// A messaging fabric able to hand out replay connections.
pub trait Fabric: Send + Sync {
    /// Opens a publish/replay connection on a subject scoped to this
    /// fabric's service.
    fn replayer(&self, subject: &str, policy: ReplayPolicy) -> Result<Box<dyn ReplayConnection>>;
}

/// A durable, ordered publish/replay channel on one subject.
#[async_trait]
pub trait ReplayConnection: Send + Sync {
    /// Publishes a payload, blocking until it is durably accepted.
    async fn publish(&self, payload: Vec<u8>) -> Result<()>;

    /// Attaches a fresh consumer and begins streaming the subject.
    ///
    /// Consumer identity is unique per attach; consumers are disposable and
    /// replaying twice yields two independent cursors.
    async fn replay(&self) -> Result<Replay>;
}

#[async_trait]
impl ReplayConnection for Box<dyn ReplayConnection> {
    async fn publish(&self, payload: Vec<u8>) -> Result<()> {
        (**self).publish(payload).await
    }

    async fn replay(&self) -> Result<Replay> {
        (**self).replay().await
    }
}

/// A live replay: the ordered delivery stream plus the caught-up latch.
pub struct Replay {
    /// Ordered stream of deliveries. Receives `None` when the connection is
    /// gone.
    pub deliveries: mpsc::Receiver<Delivery>,

    /// Fires once all messages present at attach time have been delivered
    /// and acknowledged.
    pub caught_up: CaughtUp,
}

/// One message delivered through a replay.
#[derive(Debug)]
pub struct Delivery {
    payload: Vec<u8>,
    ack: Option<oneshot::Sender<()>>,
}

impl Delivery {
    /// Creates a delivery carrying `payload`, acknowledged through `ack`.
    pub fn new(payload: Vec<u8>, ack: oneshot::Sender<()>) -> Self {
        Self {
            payload,
            ack: Some(ack),
        }
    }

    /// The raw message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Acknowledges this message. A delivery dropped without acking is
    /// redelivered.
    pub fn ack(mut self) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(());
        }
    }
}

/// One-shot latch fired when a consumer has caught up to attach time.
#[derive(Debug)]
pub struct CaughtUp(Option<oneshot::Receiver<()>>);

impl CaughtUp {
    /// Creates the latch and the sender that fires it.
    pub fn latch() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(Some(rx)))
    }

    /// Waits for the latch to fire. Safe to cancel, re-await, and call
    /// again after the latch has fired.
    ///
    /// Also returns if the producing consumer disappears; in that case the
    /// replay's delivery stream will report closure too.
    pub async fn wait(&mut self) {
        if let Some(rx) = &mut self.0 {
            let _ = rx.await;
            self.0 = None;
        }
    }
}
