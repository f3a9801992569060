//! Session Module
//!
//! An open handle on a data file: the public get/set/delete surface, the
//! growth retry loop, and the open/close lifecycle.
//!
//! ## Lifecycle
//! ```text
//!   open ──► Open(ReadOnly | WriteOnly | ReadWrite) ──► close ──► Closed
//! ```
//! Every operation on a closed session fails with `ClosedObjectViolation`.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver};
use parking_lot::{MappedRwLockReadGuard, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::arena::{checked_align_up, Arena, GROWTH_GRANULE, HEADER_SIZE};
use crate::config::{Config, OpenMode};
use crate::error::Result;
use crate::lock::{GuardKind, LockGuard, LockRegion, LockSlot};
use crate::snapshot::{SnapshotInfo, SnapshotReader, SnapshotWriter};
use crate::table::{key_hash, shard_of, TableSet, Value, MAX_LOAD_FACTOR, SHARD_COUNT};
use crate::ShmkvError;

/// Mapping plus the table set root inside it
struct Store {
    arena: Arena,
    root: u64,
}

impl Store {
    fn tables(&self) -> TableSet<'_> {
        TableSet::at(&self.arena, self.root)
    }
}

/// Point-in-time figures for a data file
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Arena size in bytes
    pub total_size: u64,
    /// Bytes on the free list
    pub free_bytes: u64,
    /// Keys across all shards
    pub entry_count: u64,
    /// Buckets across all shards
    pub bucket_count: u64,
    /// Largest bucket array in any shard
    pub max_bucket_count: u64,
    /// entry_count / bucket_count
    pub load_factor: f64,
    /// Per-shard ceiling that triggers a rehash
    pub max_load_factor: f64,
    /// Longest collision chain in any shard
    pub longest_chain: u64,
}

/// An open data file
///
/// ## Concurrency Model
///
/// - **Across processes**: the lock region. Data operations hold the global
///   lock shared plus their shard's lock; enumeration, growth, open and
///   close hold the global lock exclusively.
/// - **Within a process**: the mapping sits behind an `RwLock`. Data
///   operations take it for reading, so threads of one session work on
///   different shards concurrently; remap, growth and close take it for
///   writing.
///
/// Lock order: global → mapping → shard → allocator.
///
/// While `lock()` is held the session skips its own global and shard locks
/// on every thread, so the explicit lock is meant for one thread at a time.
pub struct Session {
    config: Config,

    /// Attached lock region
    region: Arc<LockRegion>,

    /// None once closed
    store: RwLock<Option<Store>>,

    /// Mode-exclusion lock, held for the session's lifetime
    mode_guard: Mutex<Option<LockGuard>>,

    /// Global lock held through `lock()`
    explicit: Mutex<Option<LockGuard>>,
    explicit_held: AtomicBool,

    closed: AtomicBool,

    /// Growth passes run by this session
    growths: AtomicU64,
}

impl Session {
    /// Open or create the data file described by `config`
    ///
    /// Steps:
    /// 1. Validate the path and open the file (writers create it)
    /// 2. Attach the lock region, recovering garbage or stale locks
    /// 3. Take the mode lock (shared, or exclusive for write-only)
    /// 4. Under the global lock: sweep dead shard locks, then format a new
    ///    arena or attach and verify the existing one
    pub fn open(config: Config) -> Result<Self> {
        let path = config.path.clone();
        let mode = config.mode;

        // Step 1: Validate and open
        let file = open_data_file(&path, mode)?;

        // Step 2: Lock region
        let region = LockRegion::attach(
            &path,
            &config.lock_dir,
            config.base_address,
            config.lock_recovery_timeout,
        )?;

        // Step 3: Mode exclusion
        let mode_guard = acquire_mode_lock(&region, &path, mode, &config)?;

        // Step 4: Arena
        let store = {
            let _global = region.lock_exclusive(LockSlot::Global)?;
            region.sweep_shard_locks()?;
            let store = load_store(&config, &path, file)?;
            if mode.is_writable() {
                store.arena.allocator().recover_lock()?;
            }
            store
        };

        info!(
            path = %path.display(),
            %mode,
            size = store.arena.size()?,
            region = %region.path().display(),
            "Session opened"
        );

        Ok(Self {
            config,
            region,
            store: RwLock::new(Some(store)),
            mode_guard: Mutex::new(Some(mode_guard)),
            explicit: Mutex::new(None),
            explicit_held: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            growths: AtomicU64::new(0),
        })
    }

    /// Open with a path and mode (convenience method)
    ///
    /// Uses default config otherwise.
    pub fn open_path(path: impl Into<PathBuf>, mode: OpenMode) -> Result<Self> {
        Self::open(Config::builder().path(path).mode(mode).build())
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    /// Value stored under `key`
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_open("get")?;
        let hash = key_hash(key);
        let shard = shard_of(hash);

        let _global = self.global_shared()?;
        let store = self.current_store("get")?;
        let _shard = self.shard_lock(shard, false)?;
        store.tables().shard(shard).get(key, hash)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.ensure_open("get")?;
        let hash = key_hash(key);
        let shard = shard_of(hash);

        let _global = self.global_shared()?;
        let store = self.current_store("get")?;
        let _shard = self.shard_lock(shard, false)?;
        store.tables().shard(shard).contains(key, hash)
    }

    /// Store `value` under `key`, replacing any previous value
    ///
    /// Grows the file and retries from scratch when the arena is full.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.ensure_open("set")?;
        self.ensure_writable("set")?;
        let value = value.into();
        let hash = key_hash(key);
        let shard = shard_of(hash);

        loop {
            let outcome = {
                let _global = self.global_shared()?;
                let store = self.current_store("set")?;
                let _shard = self.shard_lock(shard, true)?;
                store.tables().shard(shard).insert(key, hash, &value)
            };

            match outcome {
                Err(ShmkvError::OutOfSpace { requested }) => self.grow_for(requested)?,
                other => return other,
            }
        }
    }

    /// Remove `key`; removing an absent key is not an error
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open("delete")?;
        self.ensure_writable("delete")?;
        let hash = key_hash(key);
        let shard = shard_of(hash);

        let _global = self.global_shared()?;
        let store = self.current_store("delete")?;
        let _shard = self.shard_lock(shard, true)?;
        store.tables().shard(shard).remove(key, hash)?;
        Ok(())
    }

    /// Every key, shard by shard in bucket order
    pub fn enumerate(&self) -> Result<Vec<String>> {
        self.ensure_open("enumerate")?;
        let _global = self.global_exclusive()?;
        let store = self.current_store("enumerate")?;
        store.tables().keys()
    }

    /// Every key with its value, in `enumerate` order
    pub fn entries(&self) -> Result<Vec<(String, Value)>> {
        self.ensure_open("enumerate")?;
        let _global = self.global_exclusive()?;
        let store = self.current_store("enumerate")?;
        store.tables().entries()
    }

    pub fn len(&self) -> Result<u64> {
        self.ensure_open("count")?;
        let _global = self.global_exclusive()?;
        let store = self.current_store("count")?;
        store.tables().len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    // =========================================================================
    // Explicit Locking
    // =========================================================================

    /// Hold the global lock exclusively until `unlock`
    pub fn lock(&self) -> Result<()> {
        self.ensure_open("lock")?;
        let mut explicit = self.explicit.lock();
        if explicit.is_some() {
            return Err(ShmkvError::LockFailure(
                "session already holds its lock".to_string(),
            ));
        }

        *explicit = Some(self.region.lock_exclusive(LockSlot::Global)?);
        self.explicit_held.store(true, Ordering::Release);
        debug!(path = %self.config.path.display(), "Explicit lock acquired");
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let mut explicit = self.explicit.lock();
        match explicit.take() {
            Some(guard) => {
                self.explicit_held.store(false, Ordering::Release);
                drop(guard);
                debug!(path = %self.config.path.display(), "Explicit lock released");
                Ok(())
            }
            None => Err(ShmkvError::LockFailure(
                "unlock without a held lock".to_string(),
            )),
        }
    }

    /// Run `f` while holding the explicit lock
    pub fn with_lock<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.lock()?;
        let result = f(self);
        let unlocked = self.unlock();
        let value = result?;
        unlocked?;
        Ok(value)
    }

    pub fn is_locked(&self) -> bool {
        self.explicit_held.load(Ordering::Acquire)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn stats(&self) -> Result<Stats> {
        self.ensure_open("stats")?;
        let _global = self.global_shared()?;
        let store = self.current_store("stats")?;

        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for shard in 0..SHARD_COUNT {
            shards.push(self.shard_lock(shard, false)?);
        }

        let tables = store.tables();
        let mut stats = Stats {
            total_size: store.arena.size()?,
            free_bytes: store.arena.free_bytes()?,
            entry_count: 0,
            bucket_count: 0,
            max_bucket_count: 0,
            load_factor: 0.0,
            max_load_factor: MAX_LOAD_FACTOR,
            longest_chain: 0,
        };
        for index in 0..SHARD_COUNT {
            let shard = tables.shard(index);
            let buckets = shard.bucket_count()?;
            stats.entry_count += shard.len()?;
            stats.bucket_count += buckets;
            stats.max_bucket_count = stats.max_bucket_count.max(buckets);
            stats.longest_chain = stats.longest_chain.max(shard.longest_chain()?);
        }
        if stats.bucket_count > 0 {
            stats.load_factor = stats.entry_count as f64 / stats.bucket_count as f64;
        }
        Ok(stats)
    }

    /// Arena size in bytes
    pub fn size(&self) -> Result<u64> {
        self.ensure_open("get size")?;
        let _global = self.global_shared()?;
        self.current_store("get size")?.arena.size()
    }

    /// Bytes still free in the arena
    pub fn free_memory(&self) -> Result<u64> {
        self.ensure_open("get free memory")?;
        let _global = self.global_shared()?;
        self.current_store("get free memory")?.arena.free_bytes()
    }

    /// Growth passes this session has run
    pub fn growth_count(&self) -> u64 {
        self.growths.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn mode(&self) -> OpenMode {
        self.config.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        !self.is_closed()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Write every entry to a snapshot file at `path`
    pub fn export(&self, path: &Path) -> Result<SnapshotInfo> {
        let entries = self.entries()?;
        let snapshot = SnapshotWriter::write(path, &entries)?;
        info!(
            path = %path.display(),
            entries = snapshot.entry_count,
            "Snapshot exported"
        );
        Ok(snapshot)
    }

    /// Set every entry of the snapshot at `path`; returns how many
    pub fn import(&self, path: &Path) -> Result<usize> {
        self.ensure_open("set")?;
        self.ensure_writable("set")?;
        let entries = SnapshotReader::read(path)?;
        for entry in &entries {
            self.set(&entry.key, entry.value.clone())?;
        }
        info!(path = %path.display(), entries = entries.len(), "Snapshot imported");
        Ok(entries.len())
    }

    // =========================================================================
    // Close
    // =========================================================================

    /// Flush, optionally compact, and unmap
    pub fn close(&self) -> Result<()> {
        self.begin_close()?.run()
    }

    /// Mark the session closed now and finish closing on a worker thread
    pub fn close_async(&self) -> Result<CloseHandle> {
        let job = self.begin_close()?;
        let (tx, rx) = channel::bounded(1);
        let thread = thread::Builder::new()
            .name("shmkv-close".to_string())
            .spawn(move || {
                // The handle may already be gone; nobody to report to then.
                let _ = tx.send(job.run());
            })?;
        Ok(CloseHandle {
            rx,
            thread: Some(thread),
        })
    }

    /// Close on a worker thread and hand the outcome to `callback`
    ///
    /// A session that is already closed reports that to `callback` at once.
    pub fn close_with<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        match self.begin_close() {
            Ok(job) => {
                thread::Builder::new()
                    .name("shmkv-close".to_string())
                    .spawn(move || callback(job.run()))?;
            }
            Err(e) => callback(Err(e)),
        }
        Ok(())
    }

    fn begin_close(&self) -> Result<CloseJob> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ShmkvError::ClosedObjectViolation("close"));
        }

        if let Some(guard) = self.explicit.lock().take() {
            self.explicit_held.store(false, Ordering::Release);
            drop(guard);
        }

        Ok(CloseJob {
            path: self.config.path.clone(),
            region: Arc::clone(&self.region),
            store: self.store.write().take(),
            mode_guard: self.mode_guard.lock().take(),
            compact: self.config.compact_on_close && self.config.mode.is_writable(),
        })
    }

    // =========================================================================
    // Growth
    // =========================================================================

    /// Make room for a block of `requested` bytes
    ///
    /// Returns without growing if another process already grew the file or
    /// another thread of this session already made room.
    fn grow_for(&self, requested: u64) -> Result<()> {
        let mode = self.config.mode;
        if !self.config.growth_policy.permits(mode) {
            return Err(ShmkvError::GrowthDenied { mode });
        }

        let _global = self.global_exclusive()?;
        let mut guard = self.store.write();
        let store = guard
            .as_mut()
            .ok_or(ShmkvError::ClosedObjectViolation("set"))?;

        if store.arena.refresh()? {
            return Ok(());
        }

        let room = store
            .arena
            .allocator()
            .free_blocks()?
            .into_iter()
            .any(|(_, size)| size >= requested);
        if room {
            return Ok(());
        }

        store.arena.grow_for(requested)?;
        self.growths.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.is_closed() {
            return Err(ShmkvError::ClosedObjectViolation(op));
        }
        Ok(())
    }

    fn ensure_writable(&self, op: &'static str) -> Result<()> {
        if !self.config.mode.is_writable() {
            return Err(ShmkvError::ReadOnlyViolation(op));
        }
        Ok(())
    }

    /// The mapping, remapped first if another process resized the file
    ///
    /// Callers hold the global lock, so the declared size cannot change
    /// between the check and the use.
    fn current_store(&self, op: &'static str) -> Result<MappedRwLockReadGuard<'_, Store>> {
        loop {
            {
                let guard = RwLockReadGuard::try_map(self.store.read(), |store| store.as_ref())
                    .map_err(|_| ShmkvError::ClosedObjectViolation(op))?;
                if !guard.arena.is_stale()? {
                    return Ok(guard);
                }
            }

            let mut guard = self.store.write();
            match guard.as_mut() {
                Some(store) => {
                    store.arena.refresh()?;
                }
                None => return Err(ShmkvError::ClosedObjectViolation(op)),
            }
        }
    }

    fn global_shared(&self) -> Result<Option<LockGuard>> {
        if self.explicit_held.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.region.lock_shared(LockSlot::Global).map(Some)
    }

    fn global_exclusive(&self) -> Result<Option<LockGuard>> {
        if self.explicit_held.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.region.lock_exclusive(LockSlot::Global).map(Some)
    }

    fn shard_lock(&self, shard: usize, exclusive: bool) -> Result<Option<LockGuard>> {
        if self.explicit_held.load(Ordering::Acquire) {
            return Ok(None);
        }
        let slot = LockSlot::Shard(shard);
        let guard = if exclusive {
            self.region.lock_exclusive(slot)?
        } else {
            self.region.lock_shared(slot)?
        };
        Ok(Some(guard))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Some(store) = self.store.get_mut().as_ref() {
            if let Err(e) = store.arena.flush() {
                warn!(path = %self.config.path.display(), error = %e, "Flush on drop failed");
            }
        }
        // The mode guard and any explicit guard release themselves.
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.config.path)
            .field("mode", &self.config.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Close Job
// =============================================================================

/// Everything a close needs, detached from the session
struct CloseJob {
    path: PathBuf,
    region: Arc<LockRegion>,
    store: Option<Store>,
    mode_guard: Option<LockGuard>,
    compact: bool,
}

impl CloseJob {
    /// Shrinking truncates the file, so it happens only when no other
    /// session is attached: either this session holds the mode lock
    /// exclusively, or it can trade its shared hold for an exclusive one.
    fn run(self) -> Result<()> {
        let CloseJob {
            path,
            region,
            store,
            mut mode_guard,
            compact,
        } = self;

        let Some(store) = store else {
            return Ok(());
        };

        let _global = region.lock_exclusive(LockSlot::Global)?;

        let sole = compact
            && match mode_guard.as_ref().map(LockGuard::kind) {
                Some(GuardKind::Exclusive) => true,
                _ => {
                    drop(mode_guard.take());
                    mode_guard = region.try_lock_exclusive(LockSlot::Mode)?;
                    mode_guard.is_some()
                }
            };

        if compact && !sole {
            warn!(path = %path.display(), "Other sessions are attached, skipping compaction");
        }

        let size = store.arena.close(sole)?;
        info!(path = %path.display(), size, compacted = sole, "Session closed");

        drop(mode_guard);
        Ok(())
    }
}

/// Pending `close_async`
pub struct CloseHandle {
    rx: Receiver<Result<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CloseHandle {
    /// Block until the close finishes and return its outcome
    pub fn wait(mut self) -> Result<()> {
        let outcome = self.rx.recv().map_err(|_| {
            ShmkvError::Io(io::Error::new(
                io::ErrorKind::Other,
                "close worker exited without reporting",
            ))
        })?;
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        outcome
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |thread| thread.is_finished())
    }
}

// =============================================================================
// Open Helpers
// =============================================================================

/// Reject paths that cannot hold an arena, then open the file
fn open_data_file(path: &Path, mode: OpenMode) -> Result<File> {
    let display = || path.display().to_string();

    match fs::metadata(path) {
        Ok(meta) if !meta.is_file() => return Err(ShmkvError::NotARegularFile(display())),
        Ok(meta) if meta.len() == 0 && !mode.is_writable() => {
            return Err(ShmkvError::EmptyFile(display()))
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound && mode.is_writable() => {}
        Err(e) => return Err(e.into()),
    }

    let file = OpenOptions::new()
        .read(true)
        .write(mode.is_writable())
        .create(mode.is_writable())
        .open(path)?;
    Ok(file)
}

fn acquire_mode_lock(
    region: &Arc<LockRegion>,
    path: &Path,
    mode: OpenMode,
    config: &Config,
) -> Result<LockGuard> {
    let conflict = || ShmkvError::AlreadyOpenWriteOnly(path.display().to_string());
    let timeout = config.mode_lock_timeout;

    match mode {
        OpenMode::WriteOnly => {
            let mut guard = region
                .lock_upgradable_for(LockSlot::Mode, timeout)?
                .ok_or_else(conflict)?;
            if !guard.upgrade_for(timeout) {
                return Err(conflict());
            }
            Ok(guard)
        }
        OpenMode::ReadOnly | OpenMode::ReadWrite => region
            .lock_shared_for(LockSlot::Mode, timeout)?
            .ok_or_else(conflict),
    }
}

/// Format an empty file or attach to an existing arena
///
/// Runs under the global lock, so two creators cannot both format.
fn load_store(config: &Config, path: &Path, file: File) -> Result<Store> {
    let writable = config.mode.is_writable();

    if file.metadata()?.len() == 0 {
        if !writable {
            return Err(ShmkvError::EmptyFile(path.display().to_string()));
        }

        let bucket_count = config.effective_bucket_count();
        let (size, max_size) = creation_size(config, TableSet::footprint(bucket_count)?)?;

        let arena = Arena::format(path, file, size, max_size)?;
        let root = TableSet::create(&arena, bucket_count)?.root();
        arena.flush()?;
        return Ok(Store { arena, root });
    }

    let arena = Arena::attach(path, file, writable, config.effective_max_size())?;
    let root = TableSet::open(&arena)?.root();
    Ok(Store { arena, root })
}

/// Size of a new file and the ceiling it grows under
///
/// The initial size is raised to hold the empty table set plus one granule
/// of room, then capped by the ceiling. A ceiling too small for that
/// minimum is `FileTooLarge`.
fn creation_size(config: &Config, table_footprint: u64) -> Result<(u64, u64)> {
    let max_size = config.effective_max_size();
    let minimum = HEADER_SIZE
        .checked_add(table_footprint)
        .and_then(|bytes| bytes.checked_add(GROWTH_GRANULE))
        .and_then(|bytes| checked_align_up(bytes, GROWTH_GRANULE))
        .unwrap_or(u64::MAX);

    let ceiling = max_size - max_size % GROWTH_GRANULE;
    if minimum > ceiling {
        return Err(ShmkvError::FileTooLarge {
            requested: minimum,
            max_size,
        });
    }

    let size = config.effective_initial_size().clamp(minimum, ceiling);
    Ok((size, max_size))
}
