//! Table Module
//!
//! The sharded hash table that lives inside the arena, and the values it
//! stores.
//!
//! ## Responsibilities
//! - Value cells: text or number, with checked accessors
//! - Separate-chaining shards whose nodes and bucket arrays are arena blocks
//! - The table set: 64 shards registered under one named object
//!
//! ## Hashing
//! Keys hash with xxh3-64, which is stable across processes and builds. The
//! low 6 bits pick the shard; the remaining bits pick the bucket, so the two
//! choices are independent.

mod set;
mod shard;

pub use set::TableSet;
pub use shard::Shard;

use std::fmt;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::ShmkvError;

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in every table set
pub const SHARD_COUNT: usize = 64;

/// log2(SHARD_COUNT)
pub const SHARD_BITS: u32 = 6;

/// Directory name of the table set
pub const TABLE_SET_NAME: &str = "properties";

/// A shard doubles its buckets before an insert would exceed this
pub const MAX_LOAD_FACTOR: f64 = 1.0;

const _: () = assert!(1 << SHARD_BITS == SHARD_COUNT);

/// Stable 64-bit hash of a key
pub fn key_hash(key: &str) -> u64 {
    xxh3_64(key.as_bytes())
}

/// Shard that owns `hash`
pub fn shard_of(hash: u64) -> usize {
    (hash % SHARD_COUNT as u64) as usize
}

/// Bucket for `hash` inside a shard with `bucket_count` buckets
pub fn bucket_of(hash: u64, bucket_count: u64) -> u64 {
    (hash >> SHARD_BITS) % bucket_count
}

// =============================================================================
// Values
// =============================================================================

/// Discriminant of a stored value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Text,
    Number,
}

impl ValueKind {
    /// Tag as stored in a node
    pub fn tag(self) -> u64 {
        match self {
            ValueKind::Text => 1,
            ValueKind::Number => 2,
        }
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(ValueKind::Text),
            2 => Some(ValueKind::Number),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Text => f.write_str("text"),
            ValueKind::Number => f.write_str("number"),
        }
    }
}

/// A stored value
///
/// Numbers compare by IEEE-754 rules, so a stored NaN is not equal to
/// itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Text(String),
    Number(f64),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Text(_) => ValueKind::Text,
            Value::Number(_) => ValueKind::Number,
        }
    }

    /// The text, or `WrongValueType` for a number
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Value::Text(text) => Ok(text),
            Value::Number(_) => Err(ShmkvError::WrongValueType {
                expected: ValueKind::Text,
                found: ValueKind::Number,
            }),
        }
    }

    /// The number, or `WrongValueType` for text
    pub fn as_number(&self) -> Result<f64> {
        match self {
            Value::Number(number) => Ok(*number),
            Value::Text(_) => Err(ShmkvError::WrongValueType {
                expected: ValueKind::Number,
                found: ValueKind::Text,
            }),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Value::Text(text) => Ok(text),
            Value::Number(_) => Err(ShmkvError::WrongValueType {
                expected: ValueKind::Text,
                found: ValueKind::Number,
            }),
        }
    }

    /// Bytes this value occupies after the key in a node
    pub(crate) fn stored_len(&self) -> u64 {
        match self {
            Value::Text(text) => text.len() as u64,
            Value::Number(_) => 0,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(text) => f.write_str(text),
            Value::Number(number) => write!(f, "{}", number),
        }
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::Text(text.to_string())
    }
}

impl From<String> for Value {
    fn from(text: String) -> Self {
        Value::Text(text)
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Value::Number(number)
    }
}

impl From<i32> for Value {
    fn from(number: i32) -> Self {
        Value::Number(number as f64)
    }
}

impl From<u32> for Value {
    fn from(number: u32) -> Self {
        Value::Number(number as f64)
    }
}

/// Lossy above 2^53
impl From<i64> for Value {
    fn from(number: i64) -> Self {
        Value::Number(number as f64)
    }
}
