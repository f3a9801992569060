//! Table Set
//!
//! The 64 shards of a data file, stored as one named object.
//!
//! ## Layout
//! ```text
//! ┌──────────────────┬───────────────┬────────────────────────────────┐
//! │ ShardCount (8)   │ Reserved (8)  │ 64 x Shard header (32 each)    │
//! └──────────────────┴───────────────┴────────────────────────────────┘
//! ```

use tracing::debug;

use crate::arena::{Allocator, Arena};
use crate::error::Result;
use crate::ShmkvError;

use super::shard::{bucket_bytes, too_many_buckets, SHARD_HEADER_SIZE};
use super::{shard_of, Shard, Value, SHARD_COUNT, TABLE_SET_NAME};

const SET_HEADER_SIZE: u64 = 16;

/// Bytes of the table set block payload
const SET_SIZE: u64 = SET_HEADER_SIZE + SHARD_COUNT as u64 * SHARD_HEADER_SIZE;

/// View of the table set inside an arena
pub struct TableSet<'a> {
    arena: &'a Arena,
    root: u64,
}

impl<'a> TableSet<'a> {
    /// Build an empty set with `bucket_count` buckets per shard and register it
    pub fn create(arena: &'a Arena, bucket_count: u64) -> Result<Self> {
        let root = arena.allocator().allocate(SET_SIZE)?;
        let segment = arena.segment();
        segment.fill_zero(root, SET_SIZE)?;
        segment.write_u64(root, SHARD_COUNT as u64)?;

        for shard in 0..SHARD_COUNT {
            Shard::init(arena, shard_header(root, shard), bucket_count)?;
        }
        arena.register(TABLE_SET_NAME, root)?;

        debug!(root, bucket_count, "Table set created");
        Ok(Self { arena, root })
    }

    /// Locate the registered set and check its shape
    pub fn open(arena: &'a Arena) -> Result<Self> {
        let root = arena.find(TABLE_SET_NAME)?.ok_or_else(|| {
            ShmkvError::Corrupted(format!("no {:?} object in the arena", TABLE_SET_NAME))
        })?;

        let shards = arena.segment().read_u64(root)?;
        if shards != SHARD_COUNT as u64 {
            return Err(ShmkvError::Corrupted(format!(
                "table set has {} shards, expected {}",
                shards, SHARD_COUNT
            )));
        }
        Ok(Self { arena, root })
    }

    /// View of a set already checked by `open`
    pub fn at(arena: &'a Arena, root: u64) -> Self {
        Self { arena, root }
    }

    /// Arena bytes a fresh set with `bucket_count` buckets per shard takes
    ///
    /// Fails with `Config` when the figure does not fit in a u64.
    pub fn footprint(bucket_count: u64) -> Result<u64> {
        let buckets = Allocator::block_size_for(bucket_bytes(bucket_count)?);
        (SHARD_COUNT as u64)
            .checked_mul(buckets)
            .and_then(|shards| shards.checked_add(Allocator::block_size_for(SET_SIZE)))
            .ok_or_else(|| too_many_buckets(bucket_count))
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn shard(&self, index: usize) -> Shard<'a> {
        Shard::new(self.arena, shard_header(self.root, index % SHARD_COUNT))
    }

    pub fn shard_for(&self, hash: u64) -> Shard<'a> {
        self.shard(shard_of(hash))
    }

    // =========================================================================
    // Whole-set Queries
    //
    // Callers hold the global lock exclusively, or every shard lock.
    // =========================================================================

    pub fn len(&self) -> Result<u64> {
        let mut len = 0;
        for shard in 0..SHARD_COUNT {
            len += self.shard(shard).len()?;
        }
        Ok(len)
    }

    /// Keys of shard 0 through 63, each in bucket order
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for shard in 0..SHARD_COUNT {
            keys.extend(self.shard(shard).keys()?);
        }
        Ok(keys)
    }

    pub fn entries(&self) -> Result<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        for shard in 0..SHARD_COUNT {
            entries.extend(self.shard(shard).entries()?);
        }
        Ok(entries)
    }
}

fn shard_header(root: u64, shard: usize) -> u64 {
    root + SET_HEADER_SIZE + shard as u64 * SHARD_HEADER_SIZE
}
