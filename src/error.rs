//! Error types for shmkv
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

use crate::config::OpenMode;
use crate::table::ValueKind;

/// Result type alias using ShmkvError
pub type Result<T> = std::result::Result<T, ShmkvError>;

/// Unified error type for shmkv operations
#[derive(Debug, Error)]
pub enum ShmkvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Value Errors
    // -------------------------------------------------------------------------
    #[error("Wrong value type: expected {expected}, found {found}")]
    WrongValueType { expected: ValueKind, found: ValueKind },

    // -------------------------------------------------------------------------
    // Arena Errors
    // -------------------------------------------------------------------------
    #[error("File grew too large: {requested} bytes needed, ceiling is {max_size} bytes")]
    FileTooLarge { requested: u64, max_size: u64 },

    /// Raised by the allocator and always turned into a growth pass by
    /// `Session::set`; callers of the session API never see it.
    #[error("Arena out of space: {requested} bytes requested")]
    OutOfSpace { requested: u64 },

    #[error("A {mode} session is not permitted to grow the file")]
    GrowthDenied { mode: OpenMode },

    #[error("Corruption detected: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Lock Errors
    // -------------------------------------------------------------------------
    #[error("Lock failure: {0}")]
    LockFailure(String),

    #[error("Mode conflict on {0}: a write-only session excludes all other sessions")]
    AlreadyOpenWriteOnly(String),

    // -------------------------------------------------------------------------
    // Session Errors
    // -------------------------------------------------------------------------
    #[error("Read-only object: cannot {0}")]
    ReadOnlyViolation(&'static str),

    #[error("Closed object: cannot {0}")]
    ClosedObjectViolation(&'static str),

    #[error("{0} is not a regular file")]
    NotARegularFile(String),

    #[error("{0} is an empty file")]
    EmptyFile(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for ShmkvError {
    fn from(err: bincode::Error) -> Self {
        ShmkvError::Serialization(err.to_string())
    }
}
