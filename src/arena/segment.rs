//! Mapped Segment
//!
//! Owns the data file and its mapping, and hands out bounds-checked views at
//! byte offsets. All multi-byte fields are little-endian.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::AtomicU32;

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::error::Result;
use crate::ShmkvError;

/// The mapped data file
///
/// Reads and writes go through `&self`: the mapping is shared with other
/// processes, so exclusion comes from the lock region rather than from the
/// borrow checker. Anything that replaces the mapping takes `&mut self`.
pub struct Segment {
    /// Path of the data file (for messages)
    path: PathBuf,

    /// Open handle to the data file
    file: File,

    /// Keeps the mapping alive; `base` points into it
    map: SegmentMap,

    /// Start of the mapping
    base: *mut u8,

    /// Mapped length in bytes
    len: usize,
}

// SAFETY: `base` points into `map`, which lives as long as the segment and
// is only replaced through `&mut self`. Concurrent access to the mapped bytes
// is coordinated by the lock region, exactly as it is between processes.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

enum SegmentMap {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Segment {
    /// Map the first `len` bytes of `file`
    pub fn map(path: &Path, file: File, len: u64, writable: bool) -> Result<Self> {
        let (map, base) = Self::map_file(path, &file, len, writable)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            base,
            len: len as usize,
        })
    }

    /// Replace the mapping with one covering `len` bytes
    ///
    /// The file must already be at least `len` bytes long.
    pub fn remap(&mut self, len: u64) -> Result<()> {
        let file_len = self.file.metadata()?.len();
        if file_len < len {
            return Err(ShmkvError::Corrupted(format!(
                "{} is {} bytes, shorter than the {} bytes being mapped",
                self.path.display(),
                file_len,
                len
            )));
        }

        self.flush()?;
        let (map, base) = Self::map_file(&self.path, &self.file, len, self.is_writable())?;
        self.map = map;
        self.base = base;
        self.len = len as usize;

        debug!(path = %self.path.display(), len, "Segment remapped");
        Ok(())
    }

    /// Flush, extend the file to `len` bytes, and remap it
    pub fn extend(&mut self, len: u64) -> Result<()> {
        self.require_writable()?;
        self.flush()?;
        self.file.set_len(len)?;
        self.remap(len)
    }

    /// Flush, unmap, and cut the file down to `len` bytes
    pub fn truncate(self, len: u64) -> Result<()> {
        self.require_writable()?;
        self.flush()?;
        let Segment { file, map, .. } = self;
        drop(map);
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Write dirty pages back to the file
    pub fn flush(&self) -> Result<()> {
        if let SegmentMap::ReadWrite(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, SegmentMap::ReadWrite(_))
    }

    // =========================================================================
    // Typed Views
    // =========================================================================

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.bytes(offset, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.bytes(offset, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write_bytes(offset, &value.to_le_bytes())
    }

    /// Borrow `len` bytes at `offset`
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&[u8]> {
        let start = self.check(offset, len)?;
        // SAFETY: `check` guarantees [start, start + len) lies inside the
        // mapping, which outlives the returned borrow of `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.base.add(start), len as usize) })
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.require_writable()?;
        let start = self.check(offset, data.len() as u64)?;
        // SAFETY: the destination range is inside a writable mapping
        // (checked above) and cannot overlap the caller's buffer, which is
        // never borrowed from the segment while it is being written.
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(start), data.len());
        }
        Ok(())
    }

    pub fn fill_zero(&self, offset: u64, len: u64) -> Result<()> {
        self.require_writable()?;
        let start = self.check(offset, len)?;
        // SAFETY: the range is inside a writable mapping (checked above).
        unsafe {
            ptr::write_bytes(self.base.add(start), 0, len as usize);
        }
        Ok(())
    }

    /// Atomic view of a 4-byte aligned word in a writable mapping
    pub fn atomic_u32(&self, offset: u64) -> Result<&AtomicU32> {
        self.require_writable()?;
        if offset % 4 != 0 {
            return Err(ShmkvError::Corrupted(format!(
                "misaligned atomic word at offset {}",
                offset
            )));
        }
        let start = self.check(offset, 4)?;
        // SAFETY: in bounds and 4-byte aligned (the mapping is page aligned);
        // the word is only ever accessed atomically.
        Ok(unsafe { &*(self.base.add(start) as *const AtomicU32) })
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn check(&self, offset: u64, len: u64) -> Result<usize> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len as u64 => Ok(offset as usize),
            _ => Err(ShmkvError::Corrupted(format!(
                "{}: range {}+{} outside the {} mapped bytes",
                self.path.display(),
                offset,
                len,
                self.len
            ))),
        }
    }

    fn require_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(ShmkvError::ReadOnlyViolation("modify a read-only mapping"))
        }
    }

    fn map_file(path: &Path, file: &File, len: u64, writable: bool) -> Result<(SegmentMap, *mut u8)> {
        if len == 0 {
            return Err(ShmkvError::EmptyFile(path.display().to_string()));
        }

        let mut options = MmapOptions::new();
        options.len(len as usize);

        if writable {
            // SAFETY: memory-mapped files can be modified by other processes.
            // That is the point here: every access to the shared bytes is
            // bounds-checked and coordinated through the lock region, and
            // the file is only truncated by a session holding the mode lock
            // exclusively.
            let mut map = unsafe { options.map_mut(file)? };
            let base = map.as_mut_ptr();
            Ok((SegmentMap::ReadWrite(map), base))
        } else {
            // SAFETY: as above; the mapping is never written through.
            let map = unsafe { options.map(file)? };
            let base = map.as_ptr() as *mut u8;
            Ok((SegmentMap::ReadOnly(map), base))
        }
    }
}
