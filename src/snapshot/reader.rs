//! Snapshot Reader

use std::fs;
use std::path::Path;

use crate::error::Result;
use crate::ShmkvError;

use super::{SnapshotEntry, FOOTER_SIZE, HEADER_SIZE, MAGIC, VERSION};

/// Reads and verifies snapshot files
pub struct SnapshotReader;

impl SnapshotReader {
    /// Read every entry, rejecting anything truncated or altered
    pub fn read(path: &Path) -> Result<Vec<SnapshotEntry>> {
        let data = fs::read(path)?;
        let corrupt = |what: &str| {
            ShmkvError::Corrupted(format!("snapshot {}: {}", path.display(), what))
        };

        if (data.len() as u64) < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt("truncated header"));
        }

        if &data[0..4] != MAGIC {
            return Err(corrupt("bad magic"));
        }

        let version = u16::from_le_bytes([data[4], data[5]]);
        if version != VERSION {
            return Err(corrupt(&format!("unsupported version {}", version)));
        }

        let entry_count = read_u64(&data[6..14]);
        let payload_len = read_u64(&data[14..22]);

        // Header, payload and footer must account for the whole file
        let expected = HEADER_SIZE
            .checked_add(payload_len)
            .and_then(|len| len.checked_add(FOOTER_SIZE));
        if expected != Some(data.len() as u64) {
            return Err(corrupt("length does not match header"));
        }

        let start = HEADER_SIZE as usize;
        let end = start + payload_len as usize;
        let payload = &data[start..end];
        let stored_crc = u32::from_le_bytes([data[end], data[end + 1], data[end + 2], data[end + 3]]);
        if crc32fast::hash(payload) != stored_crc {
            return Err(corrupt("checksum mismatch"));
        }

        let entries: Vec<SnapshotEntry> = bincode::deserialize(payload)?;
        if entries.len() as u64 != entry_count {
            return Err(corrupt("entry count does not match header"));
        }
        Ok(entries)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}
