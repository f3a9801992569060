//! Arena Manager
//!
//! Creates, attaches, grows and closes the data file, and keeps the named-
//! object directory in its header.

use std::fs::File;
use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;
use crate::ShmkvError;

use super::{
    checked_align_up, Allocator, Segment, ALIGNMENT, DIRECTORY_SLOTS, DIRECTORY_SLOT_SIZE, FORMAT_VERSION,
    GROWTH_GRANULE, HEADER_SIZE, MAGIC, MIN_BLOCK, NAME_LEN, OFF_DIRECTORY, OFF_MAGIC,
    OFF_SIZE, OFF_VERSION,
};

/// The mapped arena
pub struct Arena {
    segment: Segment,

    /// Ceiling for growth, already rounded down to the alignment
    max_size: u64,
}

impl Arena {
    /// Lay out a fresh arena of `size` bytes in `file`
    ///
    /// `size` is rounded up to the growth granule; `max_size` is raised to
    /// at least that.
    pub fn format(path: &Path, file: File, size: u64, max_size: u64) -> Result<Self> {
        let size = checked_align_up(size.max(HEADER_SIZE + MIN_BLOCK), GROWTH_GRANULE)
            .ok_or(ShmkvError::FileTooLarge {
                requested: size,
                max_size,
            })?;
        let max_size = (max_size - max_size % ALIGNMENT).max(size);

        file.set_len(0)?;
        file.set_len(size)?;
        let segment = Segment::map(path, file, size, true)?;

        segment.fill_zero(0, HEADER_SIZE)?;
        segment.write_bytes(OFF_MAGIC, MAGIC)?;
        segment.write_u32(OFF_VERSION, FORMAT_VERSION)?;
        Allocator::new(&segment).format(size)?;
        segment.flush()?;

        info!(path = %path.display(), size, max_size, "Arena created");
        Ok(Self { segment, max_size })
    }

    /// Map an existing arena and check its header
    pub fn attach(path: &Path, file: File, writable: bool, max_size: u64) -> Result<Self> {
        let file_len = file.metadata()?.len();
        if file_len < HEADER_SIZE + MIN_BLOCK {
            return Err(ShmkvError::Corrupted(format!(
                "{} is too short to hold an arena ({} bytes)",
                path.display(),
                file_len
            )));
        }

        let segment = Segment::map(path, file, file_len, writable)?;

        if segment.bytes(OFF_MAGIC, MAGIC.len() as u64)? != MAGIC {
            return Err(ShmkvError::Corrupted(format!(
                "{} is not a shmkv data file",
                path.display()
            )));
        }

        let version = segment.read_u32(OFF_VERSION)?;
        if version != FORMAT_VERSION {
            return Err(ShmkvError::Corrupted(format!(
                "unsupported arena version {}",
                version
            )));
        }

        let declared = segment.read_u64(OFF_SIZE)?;
        if declared != file_len {
            return Err(ShmkvError::Corrupted(format!(
                "{} declares {} bytes but the file holds {}",
                path.display(),
                declared,
                file_len
            )));
        }

        let max_size = (max_size - max_size % ALIGNMENT).max(declared);
        debug!(path = %path.display(), size = declared, writable, "Arena attached");
        Ok(Self { segment, max_size })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn allocator(&self) -> Allocator<'_> {
        Allocator::new(&self.segment)
    }

    /// Declared size from the shared header
    pub fn size(&self) -> Result<u64> {
        self.segment.read_u64(OFF_SIZE)
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn free_bytes(&self) -> Result<u64> {
        self.allocator().free_bytes()
    }

    pub fn is_writable(&self) -> bool {
        self.segment.is_writable()
    }

    /// Whether another process resized the file since it was mapped here
    pub fn is_stale(&self) -> Result<bool> {
        Ok(self.size()? != self.segment.len() as u64)
    }

    /// Remap to the declared size if it changed; returns whether it did
    pub fn refresh(&mut self) -> Result<bool> {
        let declared = self.size()?;
        if declared == self.segment.len() as u64 {
            return Ok(false);
        }
        debug!(from = self.segment.len(), to = declared, "Following arena resize");
        self.segment.remap(declared)?;
        Ok(true)
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Extend the file so a block of `requested` bytes fits
    ///
    /// Steps:
    /// 1. target = max(2 x size, size + requested), rounded up to 4 KiB
    /// 2. Clamp to the ceiling when size + requested still fits under it
    /// 3. Flush, extend the file, remap
    /// 4. Append the new tail to the free list
    pub fn grow_for(&mut self, requested: u64) -> Result<u64> {
        let size = self.size()?;
        let needed = size.saturating_add(requested);
        if needed > self.max_size {
            return Err(ShmkvError::FileTooLarge {
                requested: needed,
                max_size: self.max_size,
            });
        }

        let target = checked_align_up(size.saturating_mul(2).max(needed), GROWTH_GRANULE)
            .map_or(self.max_size, |target| target.min(self.max_size));

        self.segment.extend(target)?;
        self.allocator().extend(size, target)?;
        self.segment.flush()?;

        info!(from = size, to = target, requested, "Arena grown");
        Ok(target)
    }

    // =========================================================================
    // Named Objects
    // =========================================================================

    /// Record `offset` under `name` in the header directory
    pub fn register(&self, name: &str, offset: u64) -> Result<()> {
        let encoded = encode_name(name)?;
        let mut vacant = None;
        for slot in 0..DIRECTORY_SLOTS {
            let at = OFF_DIRECTORY + slot * DIRECTORY_SLOT_SIZE;
            let stored = self.segment.bytes(at, NAME_LEN as u64)?;
            if stored == encoded {
                vacant = Some(at);
                break;
            }
            if vacant.is_none() && stored[0] == 0 {
                vacant = Some(at);
            }
        }

        let at = vacant.ok_or_else(|| {
            ShmkvError::Corrupted(format!("no directory slot left for {:?}", name))
        })?;
        self.segment.write_bytes(at, &encoded)?;
        self.segment.write_u64(at + NAME_LEN as u64, offset)
    }

    /// Offset registered under `name`
    pub fn find(&self, name: &str) -> Result<Option<u64>> {
        let encoded = encode_name(name)?;
        for slot in 0..DIRECTORY_SLOTS {
            let at = OFF_DIRECTORY + slot * DIRECTORY_SLOT_SIZE;
            if self.segment.bytes(at, NAME_LEN as u64)? == encoded {
                return Ok(Some(self.segment.read_u64(at + NAME_LEN as u64)?));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn flush(&self) -> Result<()> {
        self.segment.flush()
    }

    /// Flush and unmap, shrinking the file first when `compact` is set
    ///
    /// Follows any resize made by another session before touching the free
    /// list, so the caller must hold the global lock. Returns the final file
    /// size.
    pub fn close(mut self, compact: bool) -> Result<u64> {
        self.refresh()?;

        if compact && self.is_writable() {
            let size = self.allocator().shrink_to_fit()?;
            self.segment.truncate(size)?;
            return Ok(size);
        }

        self.segment.flush()?;
        let size = self.segment.len() as u64;
        drop(self.segment);
        Ok(size)
    }
}

fn encode_name(name: &str) -> Result<[u8; NAME_LEN]> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > NAME_LEN {
        return Err(ShmkvError::Config(format!(
            "object name {:?} must be 1 to {} bytes",
            name, NAME_LEN
        )));
    }
    let mut encoded = [0u8; NAME_LEN];
    encoded[..bytes.len()].copy_from_slice(bytes);
    Ok(encoded)
}
