//! Lock Region
//!
//! A fixed-size shared-memory file, separate from the data file, holding the
//! global lock, one lock per shard and the mode-exclusion lock. Every process
//! opening the same data path derives the same region name and maps the same
//! words.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use memmap2::{MmapMut, MmapOptions};
use tracing::{debug, info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::table::SHARD_COUNT;
use crate::ShmkvError;

use super::RawUpgradableLock;

// =============================================================================
// Layout
// =============================================================================

/// Bytes reserved per lock word (one cache line)
pub const LOCK_SLOT_SIZE: usize = 64;

/// Global + one per shard + mode
pub const LOCK_SLOT_COUNT: usize = SHARD_COUNT + 2;

/// Exact size of the region file
pub const LOCK_REGION_SIZE: usize = LOCK_SLOT_COUNT * LOCK_SLOT_SIZE;

const NAME_PREFIX: &str = "shmkv-";
const NAME_SUFFIX: &str = ".locks";

/// Longest normalized path kept verbatim in a region name
const MAX_NAME_LEN: usize = 200;

const _: () = assert!(LOCK_SLOT_SIZE >= std::mem::size_of::<u32>());
const _: () = assert!(LOCK_SLOT_SIZE % std::mem::align_of::<u32>() == 0);

/// One of the lock words in the region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockSlot {
    /// Structural operations exclusive, data operations shared
    Global,

    /// Per-shard reader/writer lock
    Shard(usize),

    /// Writer exclusivity across sessions
    Mode,
}

impl LockSlot {
    /// Byte offset of the slot, or None for an out-of-range shard
    pub fn offset(self) -> Option<usize> {
        let index = match self {
            LockSlot::Global => 0,
            LockSlot::Shard(shard) if shard < SHARD_COUNT => 1 + shard,
            LockSlot::Shard(_) => return None,
            LockSlot::Mode => SHARD_COUNT + 1,
        };
        Some(index * LOCK_SLOT_SIZE)
    }

    /// Every slot in layout order
    pub fn all() -> impl Iterator<Item = LockSlot> {
        std::iter::once(LockSlot::Global)
            .chain((0..SHARD_COUNT).map(LockSlot::Shard))
            .chain(std::iter::once(LockSlot::Mode))
    }
}

impl fmt::Display for LockSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockSlot::Global => f.write_str("global"),
            LockSlot::Shard(shard) => write!(f, "shard {}", shard),
            LockSlot::Mode => f.write_str("mode"),
        }
    }
}

// =============================================================================
// Region
// =============================================================================

/// Attached lock region
pub struct LockRegion {
    /// Location of the region file
    path: PathBuf,

    /// Keeps the mapping alive; `base` points into it
    map: RegionMap,

    /// Start of the mapping, valid for LOCK_REGION_SIZE bytes
    base: *mut u8,
}

// SAFETY: the region is only ever accessed through `AtomicU32` views of the
// mapping, which are safe to share between threads. The mapping lives as long
// as the region.
unsafe impl Send for LockRegion {}
unsafe impl Sync for LockRegion {}

enum RegionMap {
    Mapped(MmapMut),
    #[cfg(unix)]
    Pinned(PinnedMap),
}

impl RegionMap {
    fn len(&self) -> usize {
        match self {
            RegionMap::Mapped(map) => map.len(),
            #[cfg(unix)]
            RegionMap::Pinned(pinned) => pinned.len,
        }
    }
}

impl LockRegion {
    /// Create or attach the region for `data_path`, then recover stale locks
    ///
    /// Steps:
    /// 1. Derive the region path from the data path
    /// 2. Create the file at its fixed size if missing or mis-sized
    /// 3. Map it (optionally pinned at `base_address`)
    /// 4. Reset garbage lock words and trial-lock the global lock
    pub fn attach(
        data_path: &Path,
        lock_dir: &Path,
        base_address: Option<usize>,
        recovery_timeout: Duration,
    ) -> Result<Arc<Self>> {
        fs::create_dir_all(lock_dir)?;
        let path = Self::region_path(data_path, lock_dir)?;
        let file = Self::open_region_file(&path)?;
        let (map, base) = Self::map_region(&file, base_address)?;

        let region = Self { path, map, base };
        region.recover(recovery_timeout)?;

        debug!(region = %region.path.display(), "Lock region attached");
        Ok(Arc::new(region))
    }

    /// Remove the region file for `data_path`
    ///
    /// Returns false if there was nothing to remove. Sessions still attached
    /// keep their mapping; new sessions get a fresh region.
    pub fn remove(data_path: &Path, lock_dir: &Path) -> Result<bool> {
        let path = Self::region_path(data_path, lock_dir)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(region = %path.display(), "Lock region removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Full path of the region file for `data_path`
    pub fn region_path(data_path: &Path, lock_dir: &Path) -> Result<PathBuf> {
        Ok(lock_dir.join(Self::region_name(data_path)?))
    }

    /// Region file name derived from the absolute data path
    ///
    /// "/var/data/db.kv" → "shmkv-var_data_db.kv.locks"
    pub fn region_name(data_path: &Path) -> Result<String> {
        let absolute = absolute_path(data_path)?;
        let normalized: String = absolute
            .to_string_lossy()
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' => '_',
                other => other,
            })
            .collect();
        let normalized = normalized.trim_start_matches('_');

        if normalized.len() > MAX_NAME_LEN {
            Ok(format!(
                "{}{:016x}{}",
                NAME_PREFIX,
                xxh3_64(normalized.as_bytes()),
                NAME_SUFFIX
            ))
        } else {
            Ok(format!("{}{}{}", NAME_PREFIX, normalized, NAME_SUFFIX))
        }
    }

    /// Path of the region file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bounds-checked view of one lock word
    pub fn raw(&self, slot: LockSlot) -> Result<RawUpgradableLock<'_>> {
        let offset = slot
            .offset()
            .filter(|offset| offset + LOCK_SLOT_SIZE <= self.map.len())
            .ok_or_else(|| ShmkvError::LockFailure(format!("no lock slot for {}", slot)))?;

        // SAFETY: `offset` is inside the mapping (checked above) and is a
        // multiple of LOCK_SLOT_SIZE, hence aligned for u32. The word is only
        // accessed atomically, by this and every other process.
        let word = unsafe { &*(self.base.add(offset) as *const std::sync::atomic::AtomicU32) };
        Ok(RawUpgradableLock::new(word))
    }

    // =========================================================================
    // Guarded Acquisition
    // =========================================================================

    pub fn lock_shared(self: &Arc<Self>, slot: LockSlot) -> Result<LockGuard> {
        self.raw(slot)?.lock_shared();
        Ok(self.guard(slot, GuardKind::Shared))
    }

    pub fn lock_exclusive(self: &Arc<Self>, slot: LockSlot) -> Result<LockGuard> {
        self.raw(slot)?.lock_exclusive();
        Ok(self.guard(slot, GuardKind::Exclusive))
    }

    pub fn try_lock_exclusive(self: &Arc<Self>, slot: LockSlot) -> Result<Option<LockGuard>> {
        let acquired = self.raw(slot)?.try_lock_exclusive();
        Ok(acquired.then(|| self.guard(slot, GuardKind::Exclusive)))
    }

    pub fn lock_shared_for(
        self: &Arc<Self>,
        slot: LockSlot,
        timeout: Duration,
    ) -> Result<Option<LockGuard>> {
        let acquired = self.raw(slot)?.lock_shared_for(timeout);
        Ok(acquired.then(|| self.guard(slot, GuardKind::Shared)))
    }

    pub fn lock_upgradable_for(
        self: &Arc<Self>,
        slot: LockSlot,
        timeout: Duration,
    ) -> Result<Option<LockGuard>> {
        let acquired = self.raw(slot)?.lock_upgradable_for(timeout);
        Ok(acquired.then(|| self.guard(slot, GuardKind::Upgradable)))
    }

    fn guard(self: &Arc<Self>, slot: LockSlot, kind: GuardKind) -> LockGuard {
        LockGuard {
            region: Arc::clone(self),
            slot,
            kind,
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Reset garbage words, then trial-lock the global lock
    ///
    /// A global lock that cannot be taken within `timeout` is assumed to
    /// belong to a crashed process and is reinitialized. A slow legitimate
    /// holder looks the same and loses its lock.
    pub fn recover(&self, timeout: Duration) -> Result<()> {
        for slot in LockSlot::all() {
            let raw = self.raw(slot)?;
            if !raw.is_valid() {
                warn!(%slot, state = raw.state(), "Lock word is garbage, reinitializing");
                raw.reinitialize();
            }
        }

        let global = self.raw(LockSlot::Global)?;
        if global.lock_exclusive_for(timeout) {
            global.unlock_exclusive();
        } else {
            warn!(
                region = %self.path.display(),
                timeout_ms = timeout.as_millis() as u64,
                "Global lock looks stale, reinitializing"
            );
            global.reinitialize();
        }
        Ok(())
    }

    /// Reset every held shard lock
    ///
    /// Only sound while the caller holds the global lock exclusively: data
    /// operations hold the global lock shared for as long as they hold a shard
    /// lock, so any shard lock still held then was left by a dead process.
    pub fn sweep_shard_locks(&self) -> Result<usize> {
        let mut reset = 0;
        for shard in 0..SHARD_COUNT {
            let raw = self.raw(LockSlot::Shard(shard))?;
            if raw.is_locked() {
                warn!(shard, state = raw.state(), "Shard lock held by a dead holder, reinitializing");
                raw.reinitialize();
                reset += 1;
            }
        }
        Ok(reset)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn open_region_file(path: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len != LOCK_REGION_SIZE as u64 {
            if len != 0 {
                warn!(
                    region = %path.display(),
                    len,
                    expected = LOCK_REGION_SIZE,
                    "Lock region has the wrong size, recreating"
                );
                file.set_len(0)?;
            }
            // Zero-filled words are unlocked locks.
            file.set_len(LOCK_REGION_SIZE as u64)?;
        }
        Ok(file)
    }

    fn map_region(file: &File, base_address: Option<usize>) -> Result<(RegionMap, *mut u8)> {
        match base_address {
            None => {
                // SAFETY: the region file is only written through atomic
                // operations on its lock words; its size is fixed at
                // LOCK_REGION_SIZE and never truncated while mapped.
                let mut map = unsafe { MmapOptions::new().len(LOCK_REGION_SIZE).map_mut(file)? };
                let base = map.as_mut_ptr();
                Ok((RegionMap::Mapped(map), base))
            }
            #[cfg(unix)]
            Some(address) => {
                let pinned = PinnedMap::new(file, address, LOCK_REGION_SIZE)?;
                let base = pinned.ptr;
                Ok((RegionMap::Pinned(pinned), base))
            }
            #[cfg(not(unix))]
            Some(address) => {
                warn!(address, "Pinned lock region is unsupported on this platform, ignoring");
                Self::map_region(file, None)
            }
        }
    }
}

/// Canonical absolute form of a path that may not exist yet
fn absolute_path(path: &Path) -> Result<PathBuf> {
    if let Ok(canonical) = fs::canonicalize(path) {
        return Ok(canonical);
    }

    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match fs::canonicalize(parent) {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}

// =============================================================================
// Guards
// =============================================================================

/// How a guard holds its lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardKind {
    Shared,
    Upgradable,
    Exclusive,
}

/// Owned lock acquisition; releases on drop
pub struct LockGuard {
    region: Arc<LockRegion>,
    slot: LockSlot,
    kind: GuardKind,
}

impl LockGuard {
    pub fn slot(&self) -> LockSlot {
        self.slot
    }

    pub fn kind(&self) -> GuardKind {
        self.kind
    }

    /// Upgradable → exclusive in place
    ///
    /// Returns false, still holding the upgradable lock, if readers did not
    /// drain in time or the guard is not upgradable.
    pub fn upgrade_for(&mut self, timeout: Duration) -> bool {
        if self.kind != GuardKind::Upgradable {
            return false;
        }
        match self.region.raw(self.slot) {
            Ok(raw) if raw.upgrade_for(timeout) => {
                self.kind = GuardKind::Exclusive;
                true
            }
            _ => false,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Ok(raw) = self.region.raw(self.slot) {
            match self.kind {
                GuardKind::Shared => raw.unlock_shared(),
                GuardKind::Upgradable => raw.unlock_upgradable(),
                GuardKind::Exclusive => raw.unlock_exclusive(),
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("slot", &self.slot)
            .field("kind", &self.kind)
            .finish()
    }
}

// =============================================================================
// Pinned Mapping
// =============================================================================

/// Shared mapping placed at a caller-chosen address
#[cfg(unix)]
struct PinnedMap {
    ptr: *mut u8,
    len: usize,
}

#[cfg(unix)]
impl PinnedMap {
    fn new(file: &File, address: usize, len: usize) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        #[cfg(target_os = "linux")]
        let flags = libc::MAP_SHARED | libc::MAP_FIXED_NOREPLACE;
        #[cfg(not(target_os = "linux"))]
        let flags = libc::MAP_SHARED;

        // SAFETY: mmap with a non-replacing placement either returns a fresh
        // mapping of `len` bytes backed by `file` or MAP_FAILED; it never
        // clobbers an existing mapping.
        let ptr = unsafe {
            libc::mmap(
                address as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                file.as_raw_fd(),
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(ShmkvError::LockFailure(format!(
                "cannot map lock region at {:#x}: {}",
                address,
                io::Error::last_os_error()
            )));
        }

        if ptr as usize != address {
            // SAFETY: `ptr` is the mapping just created above.
            unsafe {
                libc::munmap(ptr, len);
            }
            return Err(ShmkvError::LockFailure(format!(
                "lock region landed at {:#x} instead of {:#x}",
                ptr as usize, address
            )));
        }

        Ok(Self {
            ptr: ptr as *mut u8,
            len,
        })
    }
}

#[cfg(unix)]
impl Drop for PinnedMap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe a mapping owned by this value.
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}
