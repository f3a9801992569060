//! Lock Coordination Module
//!
//! Cross-process locking for a shared data file.
//!
//! ## Responsibilities
//! - Upgradable reader/writer locks that live in shared memory
//! - A lock region per data path, discoverable by name from any process
//! - Recovery of locks left behind by crashed holders
//!
//! ## Region Layout
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Slot 0      Global lock        (64 B)    │
//! ├──────────────────────────────────────────┤
//! │ Slot 1..64  Shard locks  64 x  (64 B)    │
//! ├──────────────────────────────────────────┤
//! │ Slot 65     Mode lock          (64 B)    │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Roles
//! - Global: shared by get/set/delete, exclusive for enumeration, growth,
//!   open/close and the explicit session lock
//! - Shard: shared for reads, exclusive for writes within that shard
//! - Mode: shared by read-only and read-write sessions, upgraded to
//!   exclusive by the single write-only session

mod raw;
mod region;

pub use raw::RawUpgradableLock;
pub use region::{
    GuardKind, LockGuard, LockRegion, LockSlot, LOCK_REGION_SIZE, LOCK_SLOT_COUNT, LOCK_SLOT_SIZE,
};
