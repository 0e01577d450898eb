//! # Transaction Records
//!
//! The [`TxRecord`] is the sole unit of replication: a time-ordered UUID, the
//! registered transaction name, and the argument sequence. Records are
//! serialized as JSON and published to the log; nothing else crosses the
//! fabric.
//!
//! ## Wire Format
//!
//! ```json
//! { "uuid": "01890a5d-ac96-774b-bcce-b302099a8057",
//!   "name": "InsertPerson",
//!   "args": ["Rick", "Sanchez", "r@x"] }
//! ```
//!
//! Argument values must round-trip through JSON. Handlers receive them as
//! [`serde_json::Value`]s and narrow positionally; the [`args`] helpers do
//! the narrowing and produce a structured [`Error::Argument`] on mismatch.
//!
//! ## Why time-ordered UUIDs?
//!
//! UUIDv7 embeds a millisecond timestamp, so entries in the in-flight map age
//! predictably and log order and UUID order approximately agree. That makes
//! debugging replay traces pleasant; correctness never relies on it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, Result};

/// A serializable transaction for replication purposes.
///
/// Built by the write path, published to the log, and decoded by every
/// replica's apply loop. Two replicas applying the same sequence of records
/// to the same migrations end up with identical databases; handlers are
/// required to be deterministic functions of (args, prior state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    /// Time-ordered (v7) unique identifier.
    pub uuid: Uuid,

    /// The registered transaction name.
    pub name: String,

    /// Positional arguments, as JSON values.
    pub args: Vec<Value>,
}

impl TxRecord {
    /// Creates a record for a new locally originated transaction.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            uuid: Uuid::now_v7(),
            name: name.into(),
            args,
        }
    }

    /// Serializes this record to its JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a record from its JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Positional argument narrowing for transaction handlers.
///
/// Handlers receive a `&[Value]` of unknown shapes; these helpers extract one
/// position as a concrete type and return [`Error::Argument`] when the value
/// is missing or the wrong kind. Numbers decoded from JSON may arrive as
/// floats; [`integer`](args::integer) accepts any number with an exact
/// integer representation.
pub mod args {
    use super::*;

    /// Extracts argument `index` as a string slice.
    pub fn string(args: &[Value], index: usize) -> Result<&str> {
        args.get(index).and_then(Value::as_str).ok_or(Error::Argument {
            index,
            expected: "string",
        })
    }

    /// Extracts argument `index` as an i64.
    pub fn integer(args: &[Value], index: usize) -> Result<i64> {
        let value = args.get(index).ok_or(Error::Argument {
            index,
            expected: "integer",
        })?;

        // JSON does not distinguish 1 from 1.0; accept either spelling as
        // long as the value is exactly representable.
        if let Some(n) = value.as_i64() {
            return Ok(n);
        }
        if let Some(f) = value.as_f64() {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Ok(f as i64);
            }
        }

        Err(Error::Argument {
            index,
            expected: "integer",
        })
    }

    /// Extracts argument `index` as an f64.
    pub fn float(args: &[Value], index: usize) -> Result<f64> {
        args.get(index).and_then(Value::as_f64).ok_or(Error::Argument {
            index,
            expected: "number",
        })
    }

    /// Extracts argument `index` as a bool.
    pub fn boolean(args: &[Value], index: usize) -> Result<bool> {
        args.get(index).and_then(Value::as_bool).ok_or(Error::Argument {
            index,
            expected: "boolean",
        })
    }
}
