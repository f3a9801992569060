//! Upgradable lock over a single shared-memory word
//!
//! The lock is one `AtomicU32` that lives in a mapping shared between
//! processes, so it cannot park threads through the kernel or an in-process
//! queue. Waiters spin with `crossbeam::utils::Backoff` and fall back to
//! short sleeps once spinning stops paying off.
//!
//! ## State Word
//! ```text
//! ┌────────┬────────────┬──────────┬─────────────────────────┐
//! │ 31: W  │ 30: U      │ 24..29   │ 0..23                   │
//! │ writer │ upgradable │ reserved │ reader count            │
//! └────────┴────────────┴──────────┴─────────────────────────┘
//! ```
//! A zeroed word is an unlocked lock. Reserved bits set, or a writer bit
//! combined with readers, mark the word as garbage.

use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

const WRITER: u32 = 1 << 31;
const UPGRADABLE: u32 = 1 << 30;
const READER_MASK: u32 = (1 << 24) - 1;
const RESERVED_MASK: u32 = !(WRITER | UPGRADABLE | READER_MASK);

/// Sleep between attempts once the backoff has completed
const PARK_INTERVAL: Duration = Duration::from_micros(100);

/// Cross-process upgradable lock over a shared `AtomicU32`
///
/// Supports shared, exclusive and upgradable acquisition. The upgradable
/// holder coexists with readers and can atomically become the writer once
/// they drain; only one upgradable holder exists at a time.
#[derive(Clone, Copy)]
pub struct RawUpgradableLock<'a> {
    state: &'a AtomicU32,
}

impl<'a> RawUpgradableLock<'a> {
    /// Wrap a lock word
    pub fn new(state: &'a AtomicU32) -> Self {
        Self { state }
    }

    // =========================================================================
    // Non-blocking Attempts
    // =========================================================================

    pub fn try_lock_shared(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & WRITER != 0 || current & READER_MASK == READER_MASK {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn try_lock_exclusive(&self) -> bool {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub fn try_lock_upgradable(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & (WRITER | UPGRADABLE) != 0 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                current | UPGRADABLE,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Upgradable → exclusive, only once no readers remain
    pub fn try_upgrade(&self) -> bool {
        self.state
            .compare_exchange(UPGRADABLE, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    // =========================================================================
    // Blocking Acquisition
    // =========================================================================

    pub fn lock_shared(&self) {
        self.wait_until(None, || self.try_lock_shared());
    }

    pub fn lock_exclusive(&self) {
        self.wait_until(None, || self.try_lock_exclusive());
    }

    /// Returns false if the lock was not acquired within `timeout`
    pub fn lock_shared_for(&self, timeout: Duration) -> bool {
        self.wait_until(Some(Instant::now() + timeout), || self.try_lock_shared())
    }

    /// Returns false if the lock was not acquired within `timeout`
    pub fn lock_exclusive_for(&self, timeout: Duration) -> bool {
        self.wait_until(Some(Instant::now() + timeout), || self.try_lock_exclusive())
    }

    /// Returns false if the lock was not acquired within `timeout`
    pub fn lock_upgradable_for(&self, timeout: Duration) -> bool {
        self.wait_until(Some(Instant::now() + timeout), || {
            self.try_lock_upgradable()
        })
    }

    /// Returns false if readers did not drain within `timeout`; the caller
    /// still holds the upgradable lock in that case.
    pub fn upgrade_for(&self, timeout: Duration) -> bool {
        self.wait_until(Some(Instant::now() + timeout), || self.try_upgrade())
    }

    // =========================================================================
    // Release
    // =========================================================================

    pub fn unlock_shared(&self) {
        // The count may already be zero if the word was reinitialized
        // underneath this holder.
        let mut current = self.state.load(Ordering::Relaxed);
        while current & READER_MASK != 0 {
            match self.state.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn unlock_exclusive(&self) {
        self.state.fetch_and(!WRITER, Ordering::Release);
    }

    pub fn unlock_upgradable(&self) {
        self.state.fetch_and(!UPGRADABLE, Ordering::Release);
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Raw state word, for diagnostics
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::Acquire)
    }

    /// Whether the word is held in any way
    pub fn is_locked(&self) -> bool {
        self.state() != 0
    }

    /// Whether the word could have been produced by this lock
    pub fn is_valid(&self) -> bool {
        let state = self.state();
        if state & RESERVED_MASK != 0 {
            return false;
        }
        !(state & WRITER != 0 && state & (READER_MASK | UPGRADABLE) != 0)
    }

    /// Reset to the unlocked state, discarding every current holder
    pub fn reinitialize(&self) {
        self.state.store(0, Ordering::Release);
    }

    fn wait_until(&self, deadline: Option<Instant>, mut attempt: impl FnMut() -> bool) -> bool {
        let backoff = Backoff::new();
        loop {
            if attempt() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return false;
                }
            }
            if backoff.is_completed() {
                thread::sleep(PARK_INTERVAL);
            } else {
                backoff.snooze();
            }
        }
    }
}
