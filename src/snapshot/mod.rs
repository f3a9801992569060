//! Snapshot Module
//!
//! Portable, checksummed dumps of every entry in a data file. A snapshot does
//! not depend on the arena layout, so it survives format changes and can seed
//! a fresh file of any size.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │ Header (22 bytes)                                       │
//! │   Magic: "SHKS" (4) | Version: u16 (2) | Count: u64 (8) │
//! │   PayloadLen: u64 (8)                                   │
//! ├─────────────────────────────────────────────────────────┤
//! │ Payload (variable)                                      │
//! │   bincode Vec<SnapshotEntry>                            │
//! ├─────────────────────────────────────────────────────────┤
//! │ Footer (4 bytes)                                        │
//! │   PayloadCRC: u32 (4)                                   │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod reader;
mod writer;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::table::Value;

pub use reader::SnapshotReader;
pub use writer::SnapshotWriter;

// =============================================================================
// Shared Constants (used by writer and reader)
// =============================================================================

/// Magic bytes identifying a shmkv snapshot
pub(crate) const MAGIC: &[u8; 4] = b"SHKS";

/// Current snapshot format version
pub(crate) const VERSION: u16 = 1;

/// Magic (4) + Version (2) + EntryCount (8) + PayloadLen (8)
pub(crate) const HEADER_SIZE: u64 = 22;

/// PayloadCRC (4)
pub(crate) const FOOTER_SIZE: u64 = 4;

/// One key and its value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: Value,
}

/// What a written snapshot holds
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Path of the snapshot file
    pub path: PathBuf,
    /// Number of entries
    pub entry_count: u64,
    /// File size in bytes
    pub file_size: u64,
}
