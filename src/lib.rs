//! # shmkv
//!
//! A persistent key-value store shared by many processes through a
//! memory-mapped file:
//! - No server: every process maps the same file and works on it directly
//! - 64 independently locked shards for concurrent writers
//! - Cross-process locks in a separate shared-memory region, with recovery
//!   of locks left behind by crashed processes
//! - In-place growth while other processes stay attached
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Session                              │
//! │        get / set / delete / enumerate / lock / close        │
//! └──────────────┬──────────────────────────────┬───────────────┘
//!                │                              │
//!                ▼                              ▼
//!   ┌─────────────────────────┐     ┌─────────────────────────┐
//!   │      Lock Region        │     │       Table Set         │
//!   │ global | 64 shards |    │     │   64 chained shards     │
//!   │ mode   (shared memory)  │     │   (arena objects)       │
//!   └─────────────────────────┘     └────────────┬────────────┘
//!                                                │
//!                                                ▼
//!                                   ┌─────────────────────────┐
//!                                   │         Arena           │
//!                                   │ mmap | free list | grow │
//!                                   └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use shmkv::{Config, OpenMode, Session};
//!
//! let session = Session::open(
//!     Config::builder()
//!         .path("/tmp/example.shmkv")
//!         .mode(OpenMode::ReadWrite)
//!         .build(),
//! )?;
//! session.set("greeting", "hello")?;
//! session.set("answer", 42)?;
//! assert_eq!(session.get("answer")?.map(|v| v.as_number().ok()), Some(Some(42.0)));
//! session.close()?;
//! # Ok::<(), shmkv::ShmkvError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod arena;
pub mod table;
pub mod lock;
pub mod session;
pub mod snapshot;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, ShmkvError};
pub use config::{Config, GrowthPolicy, OpenMode};
pub use session::{CloseHandle, Session, Stats};
pub use table::{Value, ValueKind};

/// Delete the lock region belonging to `config.path`
///
/// Clears a mode lock left behind by a crashed write-only session. Returns
/// false if there was no region. Only safe while no session has the file
/// open.
pub fn remove_lock_region(config: &Config) -> Result<bool> {
    lock::LockRegion::remove(&config.path, &config.lock_dir)
}

// =============================================================================
// Version Info
// =============================================================================

/// Current version of shmkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
