//! Free-list Allocator
//!
//! Address-ordered first-fit over the blocks of a mapped segment. Free blocks
//! are chained through their second header word and coalesce with adjacent
//! free neighbours on release, so the list never holds two touching blocks.
//!
//! ## Block Layout
//! ```text
//! ┌──────────────┬──────────────────────────────┬───────────────┐
//! │ Size (8)     │ NextFree (8) | ALLOCATED     │ Payload ...   │
//! └──────────────┴──────────────────────────────┴───────────────┘
//! ```
//!
//! Every mutation happens under the allocator lock, a spin lock stored in the
//! arena header so that all attached processes share it.

use tracing::{debug, warn};

use crate::error::Result;
use crate::lock::RawUpgradableLock;
use crate::ShmkvError;

use super::{
    align_up, checked_align_up, Segment, ALIGNMENT, BLOCK_HEADER, GROWTH_GRANULE, HEADER_SIZE, MIN_BLOCK,
    OFF_ALLOC_LOCK, OFF_FREE_BYTES, OFF_FREE_HEAD, OFF_SIZE,
};

/// Marker in the next-free word of an allocated block
const ALLOCATED: u64 = u64::MAX;

/// End of the free list
const NIL: u64 = 0;

/// Allocator view over a mapped segment
pub struct Allocator<'a> {
    segment: &'a Segment,
}

/// Holds the allocator lock until dropped
struct AllocLock<'a> {
    raw: RawUpgradableLock<'a>,
}

impl Drop for AllocLock<'_> {
    fn drop(&mut self) {
        self.raw.unlock_exclusive();
    }
}

/// A free block found on the list, with its list predecessor
#[derive(Debug, Clone, Copy)]
struct FreeBlock {
    prev: u64,
    offset: u64,
    size: u64,
    next: u64,
}

impl<'a> Allocator<'a> {
    pub fn new(segment: &'a Segment) -> Self {
        Self { segment }
    }

    /// Block size that fits `payload` bytes
    ///
    /// Saturates for absurd payloads; no arena can hold such a block, so the
    /// request ends in `OutOfSpace` and then `FileTooLarge`.
    pub fn block_size_for(payload: u64) -> u64 {
        checked_align_up(payload.saturating_add(BLOCK_HEADER), ALIGNMENT)
            .unwrap_or(u64::MAX & !(ALIGNMENT - 1))
            .max(MIN_BLOCK)
    }

    /// Seed the free list with a single block spanning [HEADER_SIZE, size)
    ///
    /// Expects a zeroed header; the caller writes magic and version.
    pub fn format(&self, size: u64) -> Result<()> {
        let block = size - HEADER_SIZE;
        self.segment.write_u32(OFF_ALLOC_LOCK, 0)?;
        self.segment.write_u64(OFF_SIZE, size)?;
        self.write_free(HEADER_SIZE, block, NIL)?;
        self.segment.write_u64(OFF_FREE_HEAD, HEADER_SIZE)?;
        self.segment.write_u64(OFF_FREE_BYTES, block)?;
        Ok(())
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Claim a block for `payload` bytes and return the payload offset
    ///
    /// Fails with `OutOfSpace` carrying the full block size needed, which is
    /// what growth has to make room for.
    pub fn allocate(&self, payload: u64) -> Result<u64> {
        let _lock = self.lock()?;
        self.allocate_locked(Self::block_size_for(payload))
    }

    /// Release the block behind a payload offset
    pub fn deallocate(&self, payload_offset: u64) -> Result<()> {
        let _lock = self.lock()?;
        self.release_locked(payload_offset)
    }

    /// Release `old` and claim a block for `payload` bytes as one step
    ///
    /// Nothing changes unless the new block is certain to fit: either a free
    /// block is already large enough, or the old block merged with its free
    /// neighbours would be. On `OutOfSpace` the old block is still allocated.
    pub fn replace(&self, old_payload_offset: u64, payload: u64) -> Result<u64> {
        let _lock = self.lock()?;
        let need = Self::block_size_for(payload);
        let old = self.allocated_block(old_payload_offset)?;
        let old_size = self.segment.read_u64(old)?;

        let mut fits = false;
        let mut merged = old_size;
        for block in self.free_list()? {
            if block.size >= need {
                fits = true;
                break;
            }
            if block.offset + block.size == old || old + old_size == block.offset {
                merged += block.size;
            }
        }

        if !fits && merged < need {
            return Err(ShmkvError::OutOfSpace { requested: need });
        }

        self.release_locked(old_payload_offset)?;
        self.allocate_locked(need)
    }

    /// Payload capacity of an allocated block
    pub fn usable_size(&self, payload_offset: u64) -> Result<u64> {
        let block = self.allocated_block(payload_offset)?;
        Ok(self.segment.read_u64(block)? - BLOCK_HEADER)
    }

    // =========================================================================
    // Resizing
    // =========================================================================

    /// Hand the bytes in [old_size, new_size) to the free list
    ///
    /// Called after the segment has been extended and remapped.
    pub fn extend(&self, old_size: u64, new_size: u64) -> Result<()> {
        let _lock = self.lock()?;
        if self.segment.read_u64(OFF_SIZE)? != old_size || new_size <= old_size {
            return Err(ShmkvError::Corrupted(format!(
                "cannot extend arena from {} to {} bytes",
                old_size, new_size
            )));
        }

        self.segment.write_u64(OFF_SIZE, new_size)?;
        let tail = new_size - old_size;
        if tail >= MIN_BLOCK {
            self.write_free(old_size, tail, NIL)?;
            self.insert_free(old_size, tail)?;
        }
        Ok(())
    }

    /// Cut the trailing free block back to the next granule boundary and
    /// return the new arena size
    ///
    /// The size stays a multiple of the granule; whatever is left of the
    /// trailing block below that boundary stays on the free list.
    pub fn shrink_to_fit(&self) -> Result<u64> {
        let _lock = self.lock()?;
        let size = self.segment.read_u64(OFF_SIZE)?;

        let Some(block) = self.free_list()?.into_iter().last() else {
            return Ok(size);
        };
        if block.offset + block.size != size {
            return Ok(size);
        }

        let mut new_size = align_up(block.offset, GROWTH_GRANULE);
        if new_size > block.offset && new_size - block.offset < MIN_BLOCK {
            new_size += GROWTH_GRANULE;
        }
        if new_size >= size {
            return Ok(size);
        }

        let kept = new_size - block.offset;
        if kept == 0 {
            self.link(block.prev, block.next)?;
        } else {
            self.write_free(block.offset, kept, block.next)?;
        }

        let free = self.segment.read_u64(OFF_FREE_BYTES)?;
        self.segment
            .write_u64(OFF_FREE_BYTES, free.saturating_sub(block.size - kept))?;
        self.segment.write_u64(OFF_SIZE, new_size)?;

        debug!(from = size, to = new_size, "Arena shrunk to fit");
        Ok(new_size)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Sum of free block sizes, headers included
    pub fn free_bytes(&self) -> Result<u64> {
        self.segment.read_u64(OFF_FREE_BYTES)
    }

    /// (offset, size) of every free block in address order
    pub fn free_blocks(&self) -> Result<Vec<(u64, u64)>> {
        Ok(self
            .free_list()?
            .into_iter()
            .map(|block| (block.offset, block.size))
            .collect())
    }

    /// Reset the allocator lock if a dead process left it held
    ///
    /// Only sound while the caller holds the global lock exclusively.
    pub fn recover_lock(&self) -> Result<bool> {
        let raw = RawUpgradableLock::new(self.segment.atomic_u32(OFF_ALLOC_LOCK)?);
        if raw.is_locked() {
            warn!(state = raw.state(), "Allocator lock held by a dead holder, reinitializing");
            raw.reinitialize();
            return Ok(true);
        }
        Ok(false)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn lock(&self) -> Result<AllocLock<'a>> {
        let raw = RawUpgradableLock::new(self.segment.atomic_u32(OFF_ALLOC_LOCK)?);
        raw.lock_exclusive();
        Ok(AllocLock { raw })
    }

    fn allocate_locked(&self, need: u64) -> Result<u64> {
        let block = self
            .free_list()?
            .into_iter()
            .find(|block| block.size >= need)
            .ok_or(ShmkvError::OutOfSpace { requested: need })?;

        let taken = if block.size - need >= MIN_BLOCK {
            let rest = block.offset + need;
            self.write_free(rest, block.size - need, block.next)?;
            self.link(block.prev, rest)?;
            need
        } else {
            self.link(block.prev, block.next)?;
            block.size
        };

        self.segment.write_u64(block.offset, taken)?;
        self.segment.write_u64(block.offset + 8, ALLOCATED)?;

        let free = self.segment.read_u64(OFF_FREE_BYTES)?;
        self.segment.write_u64(OFF_FREE_BYTES, free.saturating_sub(taken))?;

        Ok(block.offset + BLOCK_HEADER)
    }

    fn release_locked(&self, payload_offset: u64) -> Result<()> {
        let block = self.allocated_block(payload_offset)?;
        let size = self.segment.read_u64(block)?;
        self.insert_free(block, size)
    }

    /// Insert [offset, offset + size) into the address-ordered list,
    /// merging with touching neighbours
    fn insert_free(&self, offset: u64, size: u64) -> Result<()> {
        let mut prev = NIL;
        let mut prev_size = 0;
        let mut next = self.segment.read_u64(OFF_FREE_HEAD)?;
        let mut steps = 0;
        while next != NIL && next < offset {
            self.step(&mut steps)?;
            prev = next;
            prev_size = self.segment.read_u64(next)?;
            next = self.segment.read_u64(next + 8)?;
        }

        if next == offset {
            return Err(ShmkvError::Corrupted(format!(
                "block at {} is already free",
                offset
            )));
        }

        let free = self.segment.read_u64(OFF_FREE_BYTES)?;
        self.segment.write_u64(OFF_FREE_BYTES, free + size)?;

        let mut start = offset;
        let mut merged = size;
        let mut after = next;

        if next != NIL && offset + size == next {
            merged += self.segment.read_u64(next)?;
            after = self.segment.read_u64(next + 8)?;
        }

        if prev != NIL && prev + prev_size == offset {
            start = prev;
            merged += prev_size;
            self.write_free(start, merged, after)?;
        } else {
            self.write_free(start, merged, after)?;
            self.link(prev, start)?;
        }
        Ok(())
    }

    /// Point `prev` (or the list head when NIL) at `next`
    fn link(&self, prev: u64, next: u64) -> Result<()> {
        if prev == NIL {
            self.segment.write_u64(OFF_FREE_HEAD, next)
        } else {
            self.segment.write_u64(prev + 8, next)
        }
    }

    fn write_free(&self, offset: u64, size: u64, next: u64) -> Result<()> {
        self.segment.write_u64(offset, size)?;
        self.segment.write_u64(offset + 8, next)
    }

    /// Walk the whole free list, bounded so a corrupted cycle cannot hang
    fn free_list(&self) -> Result<Vec<FreeBlock>> {
        let size = self.segment.read_u64(OFF_SIZE)?;
        let mut blocks = Vec::new();
        let mut prev = NIL;
        let mut current = self.segment.read_u64(OFF_FREE_HEAD)?;
        let mut steps = 0;

        while current != NIL {
            self.step(&mut steps)?;
            let block_size = self.segment.read_u64(current)?;
            let next = self.segment.read_u64(current + 8)?;
            if current < HEADER_SIZE
                || block_size < MIN_BLOCK
                || current + block_size > size
                || (next != NIL && next <= current)
            {
                return Err(ShmkvError::Corrupted(format!(
                    "free block at {} (size {}, next {}) is malformed",
                    current, block_size, next
                )));
            }
            blocks.push(FreeBlock {
                prev,
                offset: current,
                size: block_size,
                next,
            });
            prev = current;
            current = next;
        }
        Ok(blocks)
    }

    fn step(&self, steps: &mut u64) -> Result<()> {
        *steps += 1;
        if *steps > self.segment.len() as u64 / MIN_BLOCK + 1 {
            return Err(ShmkvError::Corrupted("free list does not terminate".into()));
        }
        Ok(())
    }

    /// Block offset behind a payload offset, checked to be allocated
    fn allocated_block(&self, payload_offset: u64) -> Result<u64> {
        let size = self.segment.read_u64(OFF_SIZE)?;
        let block = payload_offset
            .checked_sub(BLOCK_HEADER)
            .filter(|block| *block >= HEADER_SIZE && block % ALIGNMENT == 0)
            .ok_or_else(|| {
                ShmkvError::Corrupted(format!("{} is not a block payload offset", payload_offset))
            })?;

        let block_size = self.segment.read_u64(block)?;
        let marker = self.segment.read_u64(block + 8)?;
        if marker != ALLOCATED || block_size < MIN_BLOCK || block + block_size > size {
            return Err(ShmkvError::Corrupted(format!(
                "block at {} is not allocated",
                block
            )));
        }
        Ok(block)
    }
}
