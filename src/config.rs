//! Configuration for shmkv
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default arena size for a new file (5 MiB)
pub const DEFAULT_INITIAL_SIZE: u64 = 5 << 20;

/// Default growth ceiling (5000 MiB)
pub const DEFAULT_MAX_SIZE: u64 = 5000 << 20;

/// Default buckets per shard (64 shards x 16 = 1024 buckets overall)
pub const DEFAULT_BUCKET_COUNT: u64 = 16;

/// Main configuration for opening a shmkv session
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Path of the data file (the mapped arena)
    pub path: PathBuf,

    /// How the session uses the file
    pub mode: OpenMode,

    /// Size of a newly created file in bytes (0 = default)
    pub initial_size: u64,

    /// Ceiling the file may grow to in bytes (0 = default)
    pub max_size: u64,

    /// Initial buckets per shard for a newly created file (0 = default).
    /// Ignored when attaching to an existing file.
    pub bucket_count: u64,

    /// Which writable modes may extend the file when it fills up
    pub growth_policy: GrowthPolicy,

    /// Shrink the file to its minimum footprint on close
    pub compact_on_close: bool,

    // -------------------------------------------------------------------------
    // Lock Region Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the lock region file.
    /// Defaults to `/dev/shm` when it exists, else the system temp directory.
    pub lock_dir: PathBuf,

    /// Pin the lock region mapping at this virtual address (Unix only)
    pub base_address: Option<usize>,

    /// Trial-lock timeout used to detect a stale global lock on attach
    pub lock_recovery_timeout: Duration,

    /// How long an open waits for the mode-exclusion lock
    pub mode_lock_timeout: Duration,
}

/// How a session uses the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Reads only; the file must already exist
    ReadOnly,

    /// The sole writer: holds the mode lock exclusively for its lifetime
    WriteOnly,

    /// Reads and writes alongside other readers and read-write sessions
    ReadWrite,
}

impl OpenMode {
    /// Whether `set`/`delete` are permitted
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::ReadOnly)
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpenMode::ReadOnly => "read-only",
            OpenMode::WriteOnly => "write-only",
            OpenMode::ReadWrite => "read-write",
        };
        f.write_str(name)
    }
}

/// Which sessions may run the growth protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPolicy {
    /// Only the exclusive write-only session grows the file
    WriteOnly,

    /// Any writable session grows the file
    AnyWriter,
}

impl GrowthPolicy {
    /// Whether a session opened with `mode` may grow the file
    pub fn permits(self, mode: OpenMode) -> bool {
        match self {
            GrowthPolicy::WriteOnly => mode == OpenMode::WriteOnly,
            GrowthPolicy::AnyWriter => mode.is_writable(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./shmkv.data"),
            mode: OpenMode::ReadWrite,
            initial_size: DEFAULT_INITIAL_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            growth_policy: GrowthPolicy::WriteOnly,
            compact_on_close: true,
            lock_dir: default_lock_dir(),
            base_address: None,
            lock_recovery_timeout: Duration::from_secs(1),
            mode_lock_timeout: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Initial size with the zero-means-default rule applied
    pub fn effective_initial_size(&self) -> u64 {
        if self.initial_size == 0 {
            DEFAULT_INITIAL_SIZE
        } else {
            self.initial_size
        }
    }

    /// Max size with the zero-means-default rule applied
    pub fn effective_max_size(&self) -> u64 {
        if self.max_size == 0 {
            DEFAULT_MAX_SIZE
        } else {
            self.max_size
        }
    }

    /// Bucket count with the zero-means-default rule applied
    pub fn effective_bucket_count(&self) -> u64 {
        if self.bucket_count == 0 {
            DEFAULT_BUCKET_COUNT
        } else {
            self.bucket_count
        }
    }
}

/// `/dev/shm` when available, otherwise the system temp directory
pub fn default_lock_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Set the open mode
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Set the initial file size (in bytes)
    pub fn initial_size(mut self, size: u64) -> Self {
        self.config.initial_size = size;
        self
    }

    /// Set the maximum file size (in bytes)
    pub fn max_size(mut self, size: u64) -> Self {
        self.config.max_size = size;
        self
    }

    /// Set the initial buckets per shard
    pub fn bucket_count(mut self, count: u64) -> Self {
        self.config.bucket_count = count;
        self
    }

    /// Set which modes may grow the file
    pub fn growth_policy(mut self, policy: GrowthPolicy) -> Self {
        self.config.growth_policy = policy;
        self
    }

    /// Enable or disable shrink-to-fit on close
    pub fn compact_on_close(mut self, compact: bool) -> Self {
        self.config.compact_on_close = compact;
        self
    }

    /// Set the directory that holds the lock region
    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.lock_dir = dir.into();
        self
    }

    /// Pin the lock region at a fixed virtual address
    pub fn base_address(mut self, address: usize) -> Self {
        self.config.base_address = Some(address);
        self
    }

    /// Set the stale-lock trial timeout
    pub fn lock_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_recovery_timeout = timeout;
        self
    }

    /// Set the mode-exclusion lock timeout
    pub fn mode_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.mode_lock_timeout = timeout;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
