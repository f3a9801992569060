//! Concurrency tests
//!
//! These tests verify:
//! - Threads of one session write disjoint keys without loss
//! - Several sessions on one file see each other's writes
//! - Readers run alongside writers and growth
//! - The explicit lock serializes read-modify-write across sessions

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use shmkv::{Config, GrowthPolicy, OpenMode, Session, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config_for(temp: &TempDir, mode: OpenMode, initial_size: u64) -> Config {
    Config::builder()
        .path(temp.path().join("concurrent.shmkv"))
        .lock_dir(temp.path())
        .mode(mode)
        .initial_size(initial_size)
        .growth_policy(GrowthPolicy::AnyWriter)
        .build()
}

/// Open every session up front; attaching takes the global lock
fn open_sessions(temp: &TempDir, count: usize, initial_size: u64) -> Vec<Arc<Session>> {
    (0..count)
        .map(|_| {
            Arc::new(Session::open(config_for(temp, OpenMode::ReadWrite, initial_size)).unwrap())
        })
        .collect()
}

// =============================================================================
// Single Session Tests
// =============================================================================

#[test]
fn test_threads_of_one_session_write() {
    let temp = TempDir::new().unwrap();
    let session = Arc::new(Session::open(config_for(&temp, OpenMode::WriteOnly, 1 << 20)).unwrap());

    let mut handles = vec![];
    for t in 0..8 {
        let session = Arc::clone(&session);
        handles.push(thread::spawn(move || {
            for i in 0..250 {
                let key = format!("thread{}_key{}", t, i);
                session.set(&key, format!("thread{}_value{}", t, i)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(session.len().unwrap(), 8 * 250);
    for t in 0..8 {
        for i in (0..250).step_by(25) {
            assert_eq!(
                session.get(&format!("thread{}_key{}", t, i)).unwrap(),
                Some(Value::Text(format!("thread{}_value{}", t, i)))
            );
        }
    }
}

#[test]
fn test_threads_of_one_session_grow() {
    let temp = TempDir::new().unwrap();
    let session = Arc::new(Session::open(config_for(&temp, OpenMode::WriteOnly, 4096)).unwrap());

    let mut handles = vec![];
    for t in 0..4 {
        let session = Arc::clone(&session);
        handles.push(thread::spawn(move || {
            for i in 0..500 {
                session.set(&format!("t{}_{}", t, i), i).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(session.growth_count() >= 1);
    assert_eq!(session.len().unwrap(), 2000);
    assert_eq!(session.get("t3_499").unwrap(), Some(Value::from(499)));
}

#[test]
fn test_same_key_last_write_wins() {
    let temp = TempDir::new().unwrap();
    let session = Arc::new(Session::open(config_for(&temp, OpenMode::WriteOnly, 1 << 20)).unwrap());

    let mut handles = vec![];
    for t in 0..4 {
        let session = Arc::clone(&session);
        handles.push(thread::spawn(move || {
            for i in 0..200 {
                session.set("shared", (t * 1000 + i) as f64).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let last = session.get("shared").unwrap().unwrap().as_number().unwrap();
    assert!([199.0, 1199.0, 2199.0, 3199.0].contains(&last));
    assert_eq!(session.len().unwrap(), 1);
}

// =============================================================================
// Multi Session Tests
// =============================================================================

#[test]
fn test_sessions_write_concurrently() {
    let temp = TempDir::new().unwrap();
    let sessions = open_sessions(&temp, 4, 4096);
    let barrier = Arc::new(Barrier::new(sessions.len()));

    let mut handles = vec![];
    for (s, session) in sessions.iter().enumerate() {
        let session = Arc::clone(session);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..300 {
                session.set(&format!("s{}_k{}", s, i), format!("v{}", i)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    for session in &sessions {
        assert_eq!(session.len().unwrap(), 4 * 300);
        assert_eq!(session.get("s0_k299").unwrap(), Some(Value::from("v299")));
        assert_eq!(session.get("s3_k0").unwrap(), Some(Value::from("v0")));
    }
}

#[test]
fn test_readers_alongside_writers() {
    let temp = TempDir::new().unwrap();
    let sessions = open_sessions(&temp, 3, 4096);
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let session = Arc::clone(&sessions[0]);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for i in 0..1500 {
                session.set(&format!("key{}", i), i).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut readers = vec![];
    for session in &sessions[1..] {
        let session = Arc::clone(session);
        let done = Arc::clone(&done);
        readers.push(thread::spawn(move || {
            while !done.load(Ordering::Acquire) {
                // A key that is present always carries its own value
                if let Some(value) = session.get("key100").unwrap() {
                    assert_eq!(value, Value::from(100));
                }
                let keys = session.enumerate().unwrap();
                let unique: HashSet<_> = keys.iter().collect();
                assert_eq!(unique.len(), keys.len());
            }
        }));
    }

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(sessions[2].len().unwrap(), 1500);
}

#[test]
fn test_explicit_lock_blocks_other_session() {
    let temp = TempDir::new().unwrap();
    let sessions = open_sessions(&temp, 2, 1 << 20);
    let finished = Arc::new(AtomicBool::new(false));

    sessions[0].lock().unwrap();

    let blocked = {
        let session = Arc::clone(&sessions[1]);
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            session.set("k", "from_b").unwrap();
            finished.store(true, Ordering::Release);
        })
    };

    thread::sleep(Duration::from_millis(200));
    assert!(!finished.load(Ordering::Acquire));
    sessions[0].set("k", "from_a").unwrap();

    sessions[0].unlock().unwrap();
    blocked.join().unwrap();

    assert!(finished.load(Ordering::Acquire));
    assert_eq!(sessions[0].get("k").unwrap(), Some(Value::from("from_b")));
}

#[test]
fn test_with_lock_counter() {
    let temp = TempDir::new().unwrap();
    let sessions = open_sessions(&temp, 4, 1 << 20);
    sessions[0].set("counter", 0).unwrap();

    let mut handles = vec![];
    for session in &sessions {
        let session = Arc::clone(session);
        handles.push(thread::spawn(move || {
            for _ in 0..100 {
                session
                    .with_lock(|s| {
                        let current = match s.get("counter")? {
                            Some(value) => value.as_number()?,
                            None => 0.0,
                        };
                        s.set("counter", current + 1.0)
                    })
                    .unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(sessions[0].get("counter").unwrap(), Some(Value::from(400)));
}
