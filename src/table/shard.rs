//! Shard
//!
//! One separate-chaining hash table. The shard header, its bucket array and
//! every node are arena blocks addressed by offset.
//!
//! ## Node Layout
//! ```text
//! ┌──────────┬──────────┬─────────────┬─────────┬──────────────┬───────┬────────┐
//! │ Next (8) │ Hash (8) │ KeyLen (8)  │ Tag (8) │ Payload (8)  │ Key   │ Text   │
//! └──────────┴──────────┴─────────────┴─────────┴──────────────┴───────┴────────┘
//! ```
//! Payload holds the f64 bits of a number or the byte length of a text.
//!
//! Callers hold the matching shard lock: shared for lookups, exclusive for
//! anything that writes.

use tracing::debug;

use crate::arena::{Arena, MIN_BLOCK};
use crate::error::Result;
use crate::ShmkvError;

use super::{bucket_of, Value, ValueKind, MAX_LOAD_FACTOR};

/// Shard header: bucket_count, len, buckets offset, reserved
pub const SHARD_HEADER_SIZE: u64 = 32;

const SH_BUCKET_COUNT: u64 = 0;
const SH_LEN: u64 = 8;
const SH_BUCKETS: u64 = 16;

const NODE_NEXT: u64 = 0;
const NODE_HASH: u64 = 8;
const NODE_KEY_LEN: u64 = 16;
const NODE_TAG: u64 = 24;
const NODE_PAYLOAD: u64 = 32;

/// Fixed part of a node
pub const NODE_HEADER: u64 = 40;

const NIL: u64 = 0;

/// View of one shard
pub struct Shard<'a> {
    arena: &'a Arena,

    /// Offset of the shard header
    header: u64,
}

impl<'a> Shard<'a> {
    pub fn new(arena: &'a Arena, header: u64) -> Self {
        Self { arena, header }
    }

    /// Allocate a zeroed bucket array and write a fresh header at `header`
    pub fn init(arena: &'a Arena, header: u64, bucket_count: u64) -> Result<Self> {
        let buckets = allocate_buckets(arena, bucket_count)?;
        let segment = arena.segment();
        segment.write_u64(header + SH_BUCKET_COUNT, bucket_count)?;
        segment.write_u64(header + SH_LEN, 0)?;
        segment.write_u64(header + SH_BUCKETS, buckets)?;
        segment.write_u64(header + 24, 0)?;
        Ok(Self { arena, header })
    }

    pub fn len(&self) -> Result<u64> {
        self.arena.segment().read_u64(self.header + SH_LEN)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn bucket_count(&self) -> Result<u64> {
        self.arena.segment().read_u64(self.header + SH_BUCKET_COUNT)
    }

    pub fn load_factor(&self) -> Result<f64> {
        Ok(self.len()? as f64 / self.bucket_count()? as f64)
    }

    // =========================================================================
    // Lookups
    // =========================================================================

    pub fn get(&self, key: &str, hash: u64) -> Result<Option<Value>> {
        match self.find(key, hash)? {
            Some((_, node)) => Ok(Some(self.read_value(node)?)),
            None => Ok(None),
        }
    }

    pub fn contains(&self, key: &str, hash: u64) -> Result<bool> {
        Ok(self.find(key, hash)?.is_some())
    }

    /// Every key, in bucket order
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.for_each_node(|node| {
            keys.push(self.read_key(node)?);
            Ok(())
        })?;
        Ok(keys)
    }

    /// Every key with its value, in bucket order
    pub fn entries(&self) -> Result<Vec<(String, Value)>> {
        let mut entries = Vec::new();
        self.for_each_node(|node| {
            entries.push((self.read_key(node)?, self.read_value(node)?));
            Ok(())
        })?;
        Ok(entries)
    }

    /// Longest chain, for diagnostics
    pub fn longest_chain(&self) -> Result<u64> {
        let segment = self.arena.segment();
        let buckets = segment.read_u64(self.header + SH_BUCKETS)?;
        let mut longest = 0;
        for bucket in 0..self.bucket_count()? {
            let mut node = segment.read_u64(buckets + bucket * 8)?;
            let mut chain = 0;
            while node != NIL {
                chain += 1;
                self.check_steps(chain)?;
                node = segment.read_u64(node + NODE_NEXT)?;
            }
            longest = longest.max(chain);
        }
        Ok(longest)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert or replace `key`
    ///
    /// A replacement swaps the node's block through `Allocator::replace`, so
    /// an `OutOfSpace` leaves the old value in place. A new key may first
    /// double the bucket array.
    pub fn insert(&self, key: &str, hash: u64, value: &Value) -> Result<()> {
        let segment = self.arena.segment();
        let allocator = self.arena.allocator();
        let size = NODE_HEADER + key.len() as u64 + value.stored_len();

        if let Some((link, node)) = self.find(key, hash)? {
            let next = segment.read_u64(node + NODE_NEXT)?;
            let replacement = allocator.replace(node, size)?;
            self.write_node(replacement, next, hash, key, value)?;
            return segment.write_u64(link, replacement);
        }

        let len = self.len()?;
        let bucket_count = self.bucket_count()?;
        if (len + 1) as f64 > bucket_count as f64 * MAX_LOAD_FACTOR {
            self.rehash(bucket_count.saturating_mul(2))?;
        }

        let node = allocator.allocate(size)?;
        let slot = self.bucket_slot(hash)?;
        let head = segment.read_u64(slot)?;
        self.write_node(node, head, hash, key, value)?;
        segment.write_u64(slot, node)?;
        segment.write_u64(self.header + SH_LEN, len + 1)
    }

    /// Unlink and free `key`; returns whether it was present
    pub fn remove(&self, key: &str, hash: u64) -> Result<bool> {
        let segment = self.arena.segment();
        let Some((link, node)) = self.find(key, hash)? else {
            return Ok(false);
        };

        let next = segment.read_u64(node + NODE_NEXT)?;
        segment.write_u64(link, next)?;
        self.arena.allocator().deallocate(node)?;

        let len = self.len()?;
        segment.write_u64(self.header + SH_LEN, len.saturating_sub(1))?;
        Ok(true)
    }

    /// Move every node into a new array of `new_count` buckets
    pub fn rehash(&self, new_count: u64) -> Result<()> {
        let segment = self.arena.segment();
        let old_count = self.bucket_count()?;
        let old_buckets = segment.read_u64(self.header + SH_BUCKETS)?;
        let new_buckets = allocate_buckets(self.arena, new_count)?;

        let mut moved = 0;
        for bucket in 0..old_count {
            let mut node = segment.read_u64(old_buckets + bucket * 8)?;
            while node != NIL {
                moved += 1;
                self.check_steps(moved)?;
                let next = segment.read_u64(node + NODE_NEXT)?;
                let hash = segment.read_u64(node + NODE_HASH)?;
                let slot = new_buckets + bucket_of(hash, new_count) * 8;
                segment.write_u64(node + NODE_NEXT, segment.read_u64(slot)?)?;
                segment.write_u64(slot, node)?;
                node = next;
            }
        }

        segment.write_u64(self.header + SH_BUCKETS, new_buckets)?;
        segment.write_u64(self.header + SH_BUCKET_COUNT, new_count)?;
        self.arena.allocator().deallocate(old_buckets)?;

        debug!(from = old_count, to = new_count, nodes = moved, "Shard rehashed");
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn bucket_slot(&self, hash: u64) -> Result<u64> {
        let segment = self.arena.segment();
        let bucket_count = self.bucket_count()?;
        if bucket_count == 0 {
            return Err(ShmkvError::Corrupted(format!(
                "shard at {} has no buckets",
                self.header
            )));
        }
        let buckets = segment.read_u64(self.header + SH_BUCKETS)?;
        Ok(buckets + bucket_of(hash, bucket_count) * 8)
    }

    /// (offset of the word pointing at the node, node offset)
    fn find(&self, key: &str, hash: u64) -> Result<Option<(u64, u64)>> {
        let segment = self.arena.segment();
        let mut link = self.bucket_slot(hash)?;
        let mut node = segment.read_u64(link)?;
        let mut steps = 0;

        while node != NIL {
            steps += 1;
            self.check_steps(steps)?;
            if segment.read_u64(node + NODE_HASH)? == hash
                && segment.read_u64(node + NODE_KEY_LEN)? == key.len() as u64
                && segment.bytes(node + NODE_HEADER, key.len() as u64)? == key.as_bytes()
            {
                return Ok(Some((link, node)));
            }
            link = node + NODE_NEXT;
            node = segment.read_u64(link)?;
        }
        Ok(None)
    }

    fn for_each_node(&self, mut visit: impl FnMut(u64) -> Result<()>) -> Result<()> {
        let segment = self.arena.segment();
        let buckets = segment.read_u64(self.header + SH_BUCKETS)?;
        let mut steps = 0;
        for bucket in 0..self.bucket_count()? {
            let mut node = segment.read_u64(buckets + bucket * 8)?;
            while node != NIL {
                steps += 1;
                self.check_steps(steps)?;
                visit(node)?;
                node = segment.read_u64(node + NODE_NEXT)?;
            }
        }
        Ok(())
    }

    fn write_node(&self, node: u64, next: u64, hash: u64, key: &str, value: &Value) -> Result<()> {
        let segment = self.arena.segment();
        let key_len = key.len() as u64;
        segment.write_u64(node + NODE_NEXT, next)?;
        segment.write_u64(node + NODE_HASH, hash)?;
        segment.write_u64(node + NODE_KEY_LEN, key_len)?;
        segment.write_u64(node + NODE_TAG, value.kind().tag())?;
        segment.write_bytes(node + NODE_HEADER, key.as_bytes())?;
        match value {
            Value::Text(text) => {
                segment.write_u64(node + NODE_PAYLOAD, text.len() as u64)?;
                segment.write_bytes(node + NODE_HEADER + key_len, text.as_bytes())
            }
            Value::Number(number) => segment.write_u64(node + NODE_PAYLOAD, number.to_bits()),
        }
    }

    fn read_key(&self, node: u64) -> Result<String> {
        let segment = self.arena.segment();
        let key_len = segment.read_u64(node + NODE_KEY_LEN)?;
        let bytes = segment.bytes(node + NODE_HEADER, key_len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| ShmkvError::Corrupted(format!("key at {} is not UTF-8", node)))
    }

    fn read_value(&self, node: u64) -> Result<Value> {
        let segment = self.arena.segment();
        let tag = segment.read_u64(node + NODE_TAG)?;
        let payload = segment.read_u64(node + NODE_PAYLOAD)?;

        match ValueKind::from_tag(tag) {
            Some(ValueKind::Number) => Ok(Value::Number(f64::from_bits(payload))),
            Some(ValueKind::Text) => {
                let key_len = segment.read_u64(node + NODE_KEY_LEN)?;
                let bytes = segment.bytes(node + NODE_HEADER + key_len, payload)?;
                String::from_utf8(bytes.to_vec())
                    .map(Value::Text)
                    .map_err(|_| ShmkvError::Corrupted(format!("text at {} is not UTF-8", node)))
            }
            None => Err(ShmkvError::Corrupted(format!(
                "node at {} has unknown tag {}",
                node, tag
            ))),
        }
    }

    /// Chains cannot hold more nodes than the arena has blocks
    fn check_steps(&self, steps: u64) -> Result<()> {
        if steps > self.arena.segment().len() as u64 / MIN_BLOCK {
            return Err(ShmkvError::Corrupted(format!(
                "chain in shard at {} does not terminate",
                self.header
            )));
        }
        Ok(())
    }
}

fn allocate_buckets(arena: &Arena, bucket_count: u64) -> Result<u64> {
    let bytes = bucket_bytes(bucket_count)?;
    let buckets = arena.allocator().allocate(bytes)?;
    arena.segment().fill_zero(buckets, bytes)?;
    Ok(buckets)
}

/// Bytes of a bucket array with `bucket_count` slots
pub(crate) fn bucket_bytes(bucket_count: u64) -> Result<u64> {
    if bucket_count == 0 {
        return Err(ShmkvError::Config("bucket count must be at least 1".to_string()));
    }
    bucket_count
        .checked_mul(8)
        .ok_or_else(|| too_many_buckets(bucket_count))
}

pub(crate) fn too_many_buckets(bucket_count: u64) -> ShmkvError {
    ShmkvError::Config(format!("bucket count {} is too large", bucket_count))
}
