//! Tests for the shared-memory upgradable lock
//!
//! These tests verify:
//! - Shared, exclusive and upgradable compatibility
//! - Upgrade only after readers drain
//! - Timeouts on contended acquisition
//! - Garbage detection and reinitialization
//! - Mutual exclusion under thread contention

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmkv::lock::RawUpgradableLock;

// =============================================================================
// Compatibility Tests
// =============================================================================

#[test]
fn test_readers_share() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.try_lock_shared());
    assert!(lock.try_lock_shared());
    assert!(!lock.try_lock_exclusive());

    lock.unlock_shared();
    lock.unlock_shared();
    assert!(!lock.is_locked());
    assert!(lock.try_lock_exclusive());
}

#[test]
fn test_writer_excludes_everyone() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.try_lock_exclusive());
    assert!(!lock.try_lock_shared());
    assert!(!lock.try_lock_exclusive());
    assert!(!lock.try_lock_upgradable());

    lock.unlock_exclusive();
    assert!(!lock.is_locked());
}

#[test]
fn test_upgradable_coexists_with_readers() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.try_lock_upgradable());
    assert!(lock.try_lock_shared());
    // Only one upgradable holder at a time
    assert!(!lock.try_lock_upgradable());
    // Readers still present
    assert!(!lock.try_upgrade());

    lock.unlock_shared();
    assert!(lock.try_upgrade());
    assert!(!lock.try_lock_shared());

    lock.unlock_exclusive();
    assert!(!lock.is_locked());
}

#[test]
fn test_unlock_upgradable() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.try_lock_upgradable());
    lock.unlock_upgradable();
    assert_eq!(lock.state(), 0);
}

#[test]
fn test_unlock_shared_after_reinitialize_does_not_underflow() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.try_lock_shared());
    lock.reinitialize();
    lock.unlock_shared();

    assert_eq!(lock.state(), 0);
    assert!(lock.is_valid());
}

// =============================================================================
// Timeout Tests
// =============================================================================

#[test]
fn test_timed_acquisition_gives_up() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);
    assert!(lock.try_lock_exclusive());

    let start = Instant::now();
    assert!(!lock.lock_shared_for(Duration::from_millis(50)));
    assert!(!lock.lock_exclusive_for(Duration::from_millis(50)));
    assert!(!lock.lock_upgradable_for(Duration::from_millis(50)));
    assert!(start.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_upgrade_times_out_while_readers_remain() {
    let state = AtomicU32::new(0);
    let lock = RawUpgradableLock::new(&state);

    assert!(lock.lock_upgradable_for(Duration::from_millis(10)));
    assert!(lock.try_lock_shared());
    assert!(!lock.upgrade_for(Duration::from_millis(50)));

    // Still upgradable
    assert!(!lock.try_lock_upgradable());
    lock.unlock_shared();
    assert!(lock.upgrade_for(Duration::from_millis(50)));
}

#[test]
fn test_blocked_writer_proceeds_after_release() {
    let state = Arc::new(AtomicU32::new(0));
    let lock = RawUpgradableLock::new(&state);
    assert!(lock.try_lock_shared());

    let waiter = {
        let state = Arc::clone(&state);
        thread::spawn(move || {
            let lock = RawUpgradableLock::new(&state);
            lock.lock_exclusive();
            lock.unlock_exclusive();
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());
    lock.unlock_shared();
    waiter.join().unwrap();
}

// =============================================================================
// Recovery Tests
// =============================================================================

#[test]
fn test_garbage_words_are_invalid() {
    for garbage in [0x3F00_0000u32, 0x8000_0001, 0xC000_0000, u32::MAX] {
        let state = AtomicU32::new(garbage);
        let lock = RawUpgradableLock::new(&state);
        assert!(!lock.is_valid(), "{:#x} should be invalid", garbage);

        lock.reinitialize();
        assert!(lock.is_valid());
        assert!(lock.try_lock_exclusive());
    }
}

#[test]
fn test_legitimate_states_are_valid() {
    for state in [0u32, 1, 5, 0x8000_0000, 0x4000_0000, 0x4000_0003] {
        let word = AtomicU32::new(state);
        assert!(RawUpgradableLock::new(&word).is_valid(), "{:#x}", state);
    }
}

// =============================================================================
// Contention Tests
// =============================================================================

#[test]
fn test_exclusive_sections_do_not_interleave() {
    let state = Arc::new(AtomicU32::new(0));
    let counter = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let state = Arc::clone(&state);
            let counter = Arc::clone(&counter);
            thread::spawn(move || {
                let lock = RawUpgradableLock::new(&state);
                for _ in 0..1000 {
                    lock.lock_exclusive();
                    // Non-atomic read-modify-write: lost updates mean a race
                    let value = counter.load(Ordering::Relaxed);
                    thread::yield_now();
                    counter.store(value + 1, Ordering::Relaxed);
                    lock.unlock_exclusive();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::Relaxed), 8000);
    assert_eq!(state.load(Ordering::Relaxed), 0);
}

#[test]
fn test_readers_and_writers_mix() {
    let state = Arc::new(AtomicU32::new(0));
    let value = Arc::new(AtomicU64::new(0));

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let state = Arc::clone(&state);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                let lock = RawUpgradableLock::new(&state);
                for _ in 0..500 {
                    lock.lock_exclusive();
                    // Odd while a write is in progress
                    value.fetch_add(1, Ordering::Relaxed);
                    value.fetch_add(1, Ordering::Relaxed);
                    lock.unlock_exclusive();
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let state = Arc::clone(&state);
            let value = Arc::clone(&value);
            thread::spawn(move || {
                let lock = RawUpgradableLock::new(&state);
                for _ in 0..500 {
                    lock.lock_shared();
                    assert_eq!(value.load(Ordering::Relaxed) % 2, 0);
                    lock.unlock_shared();
                }
            })
        })
        .collect();

    for handle in writers.into_iter().chain(readers) {
        handle.join().unwrap();
    }
    assert_eq!(value.load(Ordering::Relaxed), 2000);
}
