//! Arena Module
//!
//! The memory-mapped data file and the allocator that carves it up.
//!
//! ## Responsibilities
//! - Map the data file and expose bounds-checked typed views of it
//! - Allocate and release blocks from an address-ordered free list
//! - Keep a small directory of named objects (the table set lives there)
//! - Grow the file in place, and shrink it to fit on close
//!
//! ## File Format
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Header (192 bytes)                                       │
//! │   Magic "SHMKVARN" (8) | Version u32 (4) | AllocLock (4) │
//! │   Size u64 (8) | FreeHead u64 (8) | FreeBytes u64 (8)    │
//! │   Reserved (24)                                          │
//! │   Directory: 4 x [Name (24) | Offset u64 (8)]            │
//! ├──────────────────────────────────────────────────────────┤
//! │ Blocks (variable)                                        │
//! │   [Size u64][NextFree u64 | ALLOCATED][Payload...]       │
//! │   ... repeated up to Size ...                            │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every offset stored in the file is relative to the start of the mapping,
//! so nothing needs rewriting when the file is remapped at a new address.

mod allocator;
mod manager;
mod segment;

pub use allocator::Allocator;
pub use manager::Arena;
pub use segment::Segment;

// =============================================================================
// Shared Constants (used by segment, allocator, manager)
// =============================================================================

/// Magic bytes identifying a shmkv data file
pub const MAGIC: &[u8; 8] = b"SHMKVARN";

/// Current arena format version
pub const FORMAT_VERSION: u32 = 1;

/// Header size; the first block starts here
pub const HEADER_SIZE: u64 = 192;

/// Allocation granularity
pub const ALIGNMENT: u64 = 8;

/// Block header: size (8) + next-free or ALLOCATED marker (8)
pub const BLOCK_HEADER: u64 = 16;

/// Smallest block worth splitting off
pub const MIN_BLOCK: u64 = 32;

/// File sizes are rounded up to this on create and grow
pub const GROWTH_GRANULE: u64 = 4096;

/// Named-object directory slots
pub const DIRECTORY_SLOTS: u64 = 4;

/// Longest object name
pub const NAME_LEN: usize = 24;

pub(crate) const OFF_MAGIC: u64 = 0;
pub(crate) const OFF_VERSION: u64 = 8;
pub(crate) const OFF_ALLOC_LOCK: u64 = 12;
pub(crate) const OFF_SIZE: u64 = 16;
pub(crate) const OFF_FREE_HEAD: u64 = 24;
pub(crate) const OFF_FREE_BYTES: u64 = 32;
pub(crate) const OFF_DIRECTORY: u64 = 64;
pub(crate) const DIRECTORY_SLOT_SIZE: u64 = NAME_LEN as u64 + 8;

const _: () = assert!(OFF_DIRECTORY + DIRECTORY_SLOTS * DIRECTORY_SLOT_SIZE <= HEADER_SIZE);
const _: () = assert!(HEADER_SIZE % ALIGNMENT == 0);
const _: () = assert!(OFF_ALLOC_LOCK % 4 == 0);

/// Round `value` up to a multiple of `align` (a power of two)
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// `align_up`, or None when the result does not fit in a u64
pub fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
