//! Snapshot Writer

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::table::Value;
use crate::ShmkvError;

use super::{SnapshotEntry, SnapshotInfo, MAGIC, VERSION};

/// Writes snapshot files
pub struct SnapshotWriter;

impl SnapshotWriter {
    /// Write `entries` to `path`, replacing any existing file
    ///
    /// The file is written under a temporary name and renamed into place,
    /// so a crash never leaves a half-written snapshot at `path`.
    pub fn write(path: &Path, entries: &[(String, Value)]) -> Result<SnapshotInfo> {
        let records: Vec<SnapshotEntry> = entries
            .iter()
            .map(|(key, value)| SnapshotEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        let payload = bincode::serialize(&records)?;
        let crc = crc32fast::hash(&payload);

        let file_name = path
            .file_name()
            .ok_or_else(|| ShmkvError::Config(format!("{} is not a file path", path.display())))?;
        let mut temp_name = file_name.to_os_string();
        temp_name.push(".tmp");
        let temp = path.with_file_name(temp_name);

        {
            let mut writer = BufWriter::new(File::create(&temp)?);
            writer.write_all(MAGIC)?;
            writer.write_all(&VERSION.to_le_bytes())?;
            writer.write_all(&(records.len() as u64).to_le_bytes())?;
            writer.write_all(&(payload.len() as u64).to_le_bytes())?;
            writer.write_all(&payload)?;
            writer.write_all(&crc.to_le_bytes())?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp, path)?;

        let file_size = fs::metadata(path)?.len();
        debug!(path = %path.display(), entries = records.len(), file_size, "Snapshot written");

        Ok(SnapshotInfo {
            path: path.to_path_buf(),
            entry_count: records.len() as u64,
            file_size,
        })
    }
}
