//! Tests for shards and the table set
//!
//! These tests verify:
//! - Insert, replace, lookup and removal inside one shard
//! - Bucket doubling before the load factor is exceeded
//! - Whole-set queries across the 64 shards
//! - Table set registration and validation

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::Path;

use shmkv::arena::Arena;
use shmkv::table::{key_hash, shard_of, TableSet, Value, SHARD_COUNT};
use shmkv::ShmkvError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_file(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .unwrap()
}

fn setup_arena() -> (TempDir, Arena) {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("tables.shmkv");
    let arena = Arena::format(&path, open_file(&path), 1 << 20, 1 << 24).unwrap();
    (temp, arena)
}

/// `count` distinct keys that all land in `shard`
fn keys_in_shard(shard: usize, count: usize) -> Vec<String> {
    (0..)
        .map(|i| format!("key-{}", i))
        .filter(|key| shard_of(key_hash(key)) == shard)
        .take(count)
        .collect()
}

// =============================================================================
// Shard Tests
// =============================================================================

#[test]
fn test_insert_and_get() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 16).unwrap();

    let hash = key_hash("alpha");
    let shard = tables.shard_for(hash);
    shard.insert("alpha", hash, &Value::from("one")).unwrap();

    assert_eq!(shard.get("alpha", hash).unwrap(), Some(Value::from("one")));
    assert!(shard.contains("alpha", hash).unwrap());
    assert_eq!(shard.len().unwrap(), 1);
}

#[test]
fn test_missing_key() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 16).unwrap();

    let hash = key_hash("ghost");
    assert_eq!(tables.shard_for(hash).get("ghost", hash).unwrap(), None);
    assert!(!tables.shard_for(hash).remove("ghost", hash).unwrap());
}

#[test]
fn test_replace_keeps_len() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 16).unwrap();
    let hash = key_hash("alpha");
    let shard = tables.shard_for(hash);

    shard.insert("alpha", hash, &Value::from(1)).unwrap();
    shard
        .insert("alpha", hash, &Value::from("replaced with a longer value"))
        .unwrap();

    assert_eq!(shard.len().unwrap(), 1);
    assert_eq!(
        shard.get("alpha", hash).unwrap(),
        Some(Value::from("replaced with a longer value"))
    );
}

#[test]
fn test_replace_in_shared_chain() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 4).unwrap();
    let keys = keys_in_shard(7, 4);
    let shard = tables.shard(7);

    for (i, key) in keys.iter().enumerate() {
        shard.insert(key, key_hash(key), &Value::from(i as i32)).unwrap();
    }
    for key in &keys {
        shard
            .insert(key, key_hash(key), &Value::from(format!("text for {}", key)))
            .unwrap();
    }

    assert_eq!(shard.len().unwrap(), 4);
    for key in &keys {
        assert_eq!(
            shard.get(key, key_hash(key)).unwrap(),
            Some(Value::from(format!("text for {}", key)))
        );
    }
}

#[test]
fn test_remove_unlinks_only_target() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 2).unwrap();
    let keys = keys_in_shard(0, 2);
    let shard = tables.shard(0);

    for key in &keys {
        shard.insert(key, key_hash(key), &Value::from(key.as_str())).unwrap();
    }
    let free_before = arena.free_bytes().unwrap();

    assert!(shard.remove(&keys[0], key_hash(&keys[0])).unwrap());

    assert_eq!(shard.len().unwrap(), 1);
    assert_eq!(shard.get(&keys[0], key_hash(&keys[0])).unwrap(), None);
    assert_eq!(
        shard.get(&keys[1], key_hash(&keys[1])).unwrap(),
        Some(Value::from(keys[1].as_str()))
    );
    assert!(arena.free_bytes().unwrap() > free_before);
}

#[test]
fn test_bucket_array_doubles_before_overload() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 4).unwrap();
    let keys = keys_in_shard(12, 5);
    let shard = tables.shard(12);

    for key in &keys[..4] {
        shard.insert(key, key_hash(key), &Value::from(1)).unwrap();
    }
    assert_eq!(shard.bucket_count().unwrap(), 4);
    assert_eq!(shard.load_factor().unwrap(), 1.0);

    shard.insert(&keys[4], key_hash(&keys[4]), &Value::from(1)).unwrap();
    assert_eq!(shard.bucket_count().unwrap(), 8);
    assert!(shard.load_factor().unwrap() <= 1.0);

    for key in &keys {
        assert!(shard.contains(key, key_hash(key)).unwrap());
    }
}

#[test]
fn test_entries_match_keys() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 2).unwrap();
    let keys = keys_in_shard(5, 6);
    let shard = tables.shard(5);

    for (i, key) in keys.iter().enumerate() {
        shard.insert(key, key_hash(key), &Value::from(i as i32)).unwrap();
    }

    let listed: Vec<String> = shard.entries().unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(listed, shard.keys().unwrap());
    assert_eq!(listed.len(), 6);
    assert!(shard.longest_chain().unwrap() >= 1);
}

// =============================================================================
// Table Set Tests
// =============================================================================

#[test]
fn test_set_spans_all_shards() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 16).unwrap();

    for i in 0..2000 {
        let key = format!("k{}", i);
        let hash = key_hash(&key);
        tables.shard_for(hash).insert(&key, hash, &Value::from(i)).unwrap();
    }

    assert_eq!(tables.len().unwrap(), 2000);
    let keys: HashSet<String> = tables.keys().unwrap().into_iter().collect();
    assert_eq!(keys.len(), 2000);
    assert!((0..SHARD_COUNT).all(|s| !tables.shard(s).is_empty().unwrap()));
}

#[test]
fn test_keys_listed_shard_by_shard() {
    let (_temp, arena) = setup_arena();
    let tables = TableSet::create(&arena, 16).unwrap();

    for i in 0..300 {
        let key = format!("k{}", i);
        let hash = key_hash(&key);
        tables.shard_for(hash).insert(&key, hash, &Value::from(i)).unwrap();
    }

    let shards: Vec<usize> = tables
        .keys()
        .unwrap()
        .iter()
        .map(|key| shard_of(key_hash(key)))
        .collect();
    assert!(shards.windows(2).all(|pair| pair[0] <= pair[1]));
}

#[test]
fn test_footprint_matches_creation_cost() {
    let (_temp, arena) = setup_arena();
    let before = arena.free_bytes().unwrap();

    TableSet::create(&arena, 16).unwrap();

    assert_eq!(before - arena.free_bytes().unwrap(), TableSet::footprint(16).unwrap());
    let tables = TableSet::open(&arena).unwrap();
    assert!((0..SHARD_COUNT).all(|s| tables.shard(s).bucket_count().unwrap() == 16));
}

#[test]
fn test_footprint_rejects_oversized_bucket_count() {
    for bucket_count in [0, u64::MAX / 4, u64::MAX / 64] {
        assert!(matches!(
            TableSet::footprint(bucket_count),
            Err(ShmkvError::Config(_))
        ));
    }
}

#[test]
fn test_open_finds_registered_set() {
    let (_temp, arena) = setup_arena();
    let root = TableSet::create(&arena, 8).unwrap().root();

    assert_eq!(TableSet::open(&arena).unwrap().root(), root);
}

#[test]
fn test_open_without_set_is_corrupted() {
    let (_temp, arena) = setup_arena();

    assert!(matches!(
        TableSet::open(&arena).err().unwrap(),
        ShmkvError::Corrupted(_)
    ));
}

#[test]
fn test_open_with_wrong_shard_count_is_corrupted() {
    let (_temp, arena) = setup_arena();
    let root = TableSet::create(&arena, 8).unwrap().root();
    arena.segment().write_u64(root, 32).unwrap();

    assert!(matches!(
        TableSet::open(&arena).err().unwrap(),
        ShmkvError::Corrupted(_)
    ));
}
