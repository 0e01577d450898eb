//! # Error Handling
//!
//! This module defines the error types used throughout libsdk. We use a single
//! error enum ([`Error`]) to represent all failure modes, which keeps function
//! signatures simple and lets callers match uniformly.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Registration | `EmptyName`, `AlreadyRegistered`, `NotRegistered`, `AlreadyStarted` | Fix the wiring; these are programming errors |
//! | Transaction | `Handler`, `HandlerPanic`, `Argument` | Rolled back locally, never replicated; surface to the caller |
//! | Replication | `Publish`, `ReplicationTimeout` | See below; these are the serious ones |
//! | Lifecycle | `Migration`, `NotReady`, `Closed` | Abort startup / stop issuing writes |
//! | Internal | `Sqlite`, `Codec`, `Rollback`, `Fabric` | Log and investigate |
//!
//! ## The replication failure modes
//!
//! `Publish` means the local transaction committed but the log rejected the
//! record: local state is ahead of the log. Callers must treat this as a
//! critical inconsistency and stop writing until restart (a restart rebuilds
//! the database from the log, which discards the stray local write).
//!
//! `ReplicationTimeout` means the record was accepted by the log but its echo
//! was not observed within the deadline. The outcome is indeterminate: the
//! record may still be applied by background replay later.

use thiserror::Error;
use uuid::Uuid;

/// All errors that can occur in libsdk operations.
///
/// # Example
///
/// ```rust,ignore
/// use libsdk::{Error, Result};
///
/// async fn insert(store: &libsdk::Store) -> Result<i64> {
///     match store.exec("InsertPerson", vec!["Rick".into()]).await {
///         Ok(id) => Ok(id.as_i64().unwrap_or_default()),
///
///         // Rolled back locally, never replicated: safe to surface.
///         Err(err) if err.is_handler_failure() => Err(err),
///
///         // Indeterminate: the record may still replicate later.
///         Err(err @ Error::ReplicationTimeout { .. }) => Err(err),
///
///         // Everything else propagates with ?
///         Err(err) => Err(err),
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A transaction name was looked up but nothing is registered under it.
    #[error("transaction '{name}' is not registered")]
    NotRegistered {
        /// The name that was looked up.
        name: String,
    },

    /// A second registration attempted to reuse an existing name.
    #[error("transaction '{name}' is already registered")]
    AlreadyRegistered {
        /// The duplicated name.
        name: String,
    },

    /// Transaction names must be non-empty.
    #[error("transaction name must not be empty")]
    EmptyName,

    /// `register` was called after `start`; the registry is sealed once the
    /// store begins replaying.
    #[error("cannot register transactions after the store has started")]
    AlreadyStarted,

    /// `exec` was called before `start` completed.
    #[error("store is not ready; call start and wait for it to return")]
    NotReady,

    /// The store has been closed; no further operations are possible.
    #[error("store is closed")]
    Closed,

    /// The handler returned a failure; the local transaction was rolled back
    /// and the record was not replicated.
    #[error("transaction '{name}' failed: {source}")]
    Handler {
        /// The transaction name whose handler failed.
        name: String,
        /// The handler's error.
        #[source]
        source: Box<Error>,
    },

    /// The handler panicked; the local transaction was rolled back.
    #[error("handler for transaction '{name}' panicked")]
    HandlerPanic {
        /// The transaction name whose handler panicked.
        name: String,
    },

    /// Rolling back after a handler failure itself failed.
    ///
    /// # When This Happens
    ///
    /// A handler returned an error, so the driver tried to roll the local
    /// transaction back, and the rollback itself failed. Likely causes:
    /// - the database file vanished or the disk filled mid-transaction
    /// - the connection was poisoned by an earlier fault
    ///
    /// # Why It Is Distinct From `Handler`
    ///
    /// After a clean `Handler` error the database is exactly as it was
    /// before the call. After `Rollback` that guarantee is gone: the state
    /// of the local transaction is unknown. The two must never be collapsed
    /// into one variant, because the recovery differs.
    ///
    /// # Recovery
    ///
    /// Stop trusting the local replica and restart the process. A restart
    /// is always safe: the database is rebuilt from scratch by replaying
    /// the log.
    #[error("rollback failed after handler error ({handler}): {source}")]
    Rollback {
        /// Display form of the handler error that triggered the rollback.
        handler: String,
        /// The rollback failure.
        #[source]
        source: Box<Error>,
    },

    /// A migration statement failed; no statements were applied.
    #[error("migration {index} failed: {source}")]
    Migration {
        /// Zero-based index of the failing statement.
        index: usize,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The log rejected a publish after the local transaction had already
    /// committed.
    ///
    /// # When This Happens
    ///
    /// The write path applies the handler locally first, then publishes the
    /// record. If the fabric is unreachable (or refuses the message) at
    /// that second step, the local commit cannot be undone in place: local
    /// state is now ahead of the log.
    ///
    /// # Systems Concept: The Replication Commit Point
    ///
    /// Publish-acceptance is the moment a write becomes part of the shared
    /// history. A commit that never reached the log exists only on this
    /// instance; peers will never see it, and a rebuilt replica of this
    /// very instance will not either.
    ///
    /// # Recovery
    ///
    /// Treat this as a critical inconsistency: refuse further writes and
    /// restart. The restart discards the stray local write implicitly,
    /// because the database is rebuilt per-process from the log.
    #[error("failed to publish transaction record to the log: {source}")]
    Publish {
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// The echo of a published record was not observed within the
    /// replication deadline.
    ///
    /// # When This Happens
    ///
    /// The record was accepted by the log, but the apply loop did not see
    /// it come back within the deadline (30 seconds by default). Typical
    /// causes: the fabric stalled after accepting the publish, or replay is
    /// far behind on a long log.
    ///
    /// # Systems Concept: Indeterminate Outcomes
    ///
    /// A timeout is not a failure verdict. The record is durably in the
    /// log, so peers (and this instance's background replay) may still
    /// apply it after this error returns. Callers must not retry blindly;
    /// a retry is a brand-new record with a new UUID and would double the
    /// write once the fabric recovers.
    ///
    /// # Recovery
    ///
    /// Check whether the write landed (a read-only query suffices: the
    /// local commit already happened) before deciding anything. The
    /// in-flight entry is left in place so a late echo completes quietly
    /// instead of re-applying the write.
    #[error("timed out waiting for transaction {uuid} to replicate")]
    ReplicationTimeout {
        /// UUID of the record whose echo never arrived.
        uuid: Uuid,
    },

    /// A handler argument was missing or had the wrong shape.
    #[error("argument {index}: expected {expected}")]
    Argument {
        /// Zero-based position of the offending argument.
        index: usize,
        /// What the handler expected to find there.
        expected: &'static str,
    },

    /// JSON encoding or decoding failed.
    ///
    /// In the apply loop this is logged and the offending message is
    /// acknowledged and skipped so a poison message cannot stall replay.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem operation failed (database directory, fabric directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The fabric (or one of its worker threads) is unavailable.
    #[error("fabric error: {0}")]
    Fabric(String),
}

impl Error {
    /// Returns true if this error means the handler itself failed (and the
    /// local transaction was cleanly rolled back).
    pub fn is_handler_failure(&self) -> bool {
        matches!(self, Error::Handler { .. } | Error::HandlerPanic { .. })
    }
}

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let not_registered = Error::NotRegistered {
            name: "InsertPerson".to_string(),
        };
        assert_eq!(
            not_registered.to_string(),
            "transaction 'InsertPerson' is not registered"
        );

        let duplicate = Error::AlreadyRegistered {
            name: "InsertPerson".to_string(),
        };
        assert_eq!(
            duplicate.to_string(),
            "transaction 'InsertPerson' is already registered"
        );

        let argument = Error::Argument {
            index: 2,
            expected: "string",
        };
        assert_eq!(argument.to_string(), "argument 2: expected string");
    }

    #[test]
    fn test_handler_failure_classification() {
        let handler = Error::Handler {
            name: "InsertPerson".to_string(),
            source: Box::new(Error::EmptyName),
        };
        assert!(handler.is_handler_failure());

        let panic = Error::HandlerPanic {
            name: "InsertPerson".to_string(),
        };
        assert!(panic.is_handler_failure());

        assert!(!Error::NotReady.is_handler_failure());
    }

    #[test]
    fn test_sqlite_error_conversion() {
        let sqlite_err = rusqlite::Error::InvalidParameterName("test".to_string());
        let our_err: Error = sqlite_err.into();
        assert!(matches!(our_err, Error::Sqlite(_)));
        assert!(our_err.to_string().contains("sqlite error"));
    }
}
