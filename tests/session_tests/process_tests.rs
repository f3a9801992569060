//! Cross-process tests
//!
//! Each test keeps a session open in this process and drives the
//! `shmkv-cli` binary against the same file, so the lock region and the
//! mapping are shared between two real processes.
//!
//! These tests verify:
//! - Writes made by another process are visible here, and the reverse
//! - A write-only session in one process excludes opens in another
//! - Snapshot export and import through the CLI
//! - Removing a lock region through the CLI

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use shmkv::{Config, GrowthPolicy, OpenMode, Session, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn data_path(temp: &TempDir) -> PathBuf {
    temp.path().join("shared.shmkv")
}

fn config_for(temp: &TempDir, mode: OpenMode) -> Config {
    Config::builder()
        .path(data_path(temp))
        .lock_dir(temp.path())
        .mode(mode)
        .initial_size(256 * 1024)
        .compact_on_close(false)
        .mode_lock_timeout(Duration::from_millis(200))
        .build()
}

fn cli(temp: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shmkv-cli"))
        .arg(data_path(temp))
        .arg("--lock-dir")
        .arg(temp.path())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn stdout_of(output: &Output) -> String {
    assert!(
        output.status.success(),
        "cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout.clone()).unwrap()
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

// =============================================================================
// Shared Data Tests
// =============================================================================

#[test]
fn test_cli_write_visible_here() {
    let temp = TempDir::new().unwrap();
    let session = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();

    assert_eq!(stdout_of(&cli(&temp, &["set", "color", "blue"])).trim(), "OK");
    assert_eq!(stdout_of(&cli(&temp, &["set", "size", "12.5", "--number"])).trim(), "OK");

    assert_eq!(session.get("color").unwrap(), Some(Value::from("blue")));
    assert_eq!(session.get("size").unwrap(), Some(Value::Number(12.5)));
}

#[test]
fn test_write_here_visible_to_cli() {
    let temp = TempDir::new().unwrap();
    let session = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();
    session.set("greeting", "hello").unwrap();
    session.set("answer", 42).unwrap();

    assert_eq!(stdout_of(&cli(&temp, &["get", "greeting"])).trim(), "hello");
    assert_eq!(stdout_of(&cli(&temp, &["get", "answer"])).trim(), "42");
    assert_eq!(stdout_of(&cli(&temp, &["get", "missing"])).trim(), "(nil)");

    let keys = stdout_of(&cli(&temp, &["keys"]));
    let mut keys: Vec<&str> = keys.lines().collect();
    keys.sort();
    assert_eq!(keys, vec!["answer", "greeting"]);
}

#[test]
fn test_cli_delete() {
    let temp = TempDir::new().unwrap();
    let session = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();
    session.set("doomed", 1).unwrap();

    stdout_of(&cli(&temp, &["del", "doomed"]));
    assert_eq!(session.get("doomed").unwrap(), None);
}

#[test]
fn test_cli_growth_followed_here() {
    let temp = TempDir::new().unwrap();
    let mut config = config_for(&temp, OpenMode::ReadWrite);
    config.initial_size = 4096;
    config.growth_policy = GrowthPolicy::AnyWriter;
    let session = Session::open(config).unwrap();
    let before = session.size().unwrap();

    let large = "y".repeat(20_000);
    stdout_of(&cli(&temp, &["--allow-growth", "set", "large", &large]));

    assert!(session.size().unwrap() > before);
    assert_eq!(session.get("large").unwrap(), Some(Value::Text(large)));
}

#[test]
fn test_cli_stats() {
    let temp = TempDir::new().unwrap();
    let session = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();
    session.set("a", 1).unwrap();

    let stats = stdout_of(&cli(&temp, &["stats"]));
    assert!(stats.contains("entry_count      1"));
    assert!(stats.contains("bucket_count     1024"));
}

// =============================================================================
// Mode Exclusion Tests
// =============================================================================

#[test]
fn test_write_only_here_excludes_cli() {
    let temp = TempDir::new().unwrap();
    let session = Session::open(config_for(&temp, OpenMode::WriteOnly)).unwrap();
    session.set("k", "v").unwrap();

    let output = cli(&temp, &["get", "k"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Mode conflict"));

    session.close().unwrap();
    assert_eq!(stdout_of(&cli(&temp, &["get", "k"])).trim(), "v");
}

#[test]
fn test_cli_write_only_refused_while_attached() {
    let temp = TempDir::new().unwrap();
    let writer = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();
    let output = cli(&temp, &["--write-only", "set", "k", "v"]);
    assert!(!output.status.success());
    assert_eq!(writer.get("k").unwrap(), None);

    writer.close().unwrap();
    stdout_of(&cli(&temp, &["--write-only", "set", "k", "v"]));
}

#[test]
fn test_cli_remove_lock() {
    let temp = TempDir::new().unwrap();
    Session::open(config_for(&temp, OpenMode::ReadWrite))
        .unwrap()
        .close()
        .unwrap();

    assert_eq!(stdout_of(&cli(&temp, &["remove-lock"])).trim(), "removed");
    assert_eq!(stdout_of(&cli(&temp, &["remove-lock"])).trim(), "no lock region");
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_cli_export_import() {
    let temp = TempDir::new().unwrap();
    let snapshot = temp.path().join("dump.shks");
    {
        let session = Session::open(config_for(&temp, OpenMode::ReadWrite)).unwrap();
        for i in 0..20 {
            session.set(&format!("k{}", i), i).unwrap();
        }
        assert_eq!(
            stdout_of(&cli(&temp, &["export", arg(&snapshot)])).trim(),
            "exported 20 entries"
        );
        for i in 0..20 {
            session.delete(&format!("k{}", i)).unwrap();
        }
        assert_eq!(
            stdout_of(&cli(&temp, &["import", arg(&snapshot)])).trim(),
            "imported 20 entries"
        );
        assert_eq!(session.len().unwrap(), 20);
        assert_eq!(session.get("k7").unwrap(), Some(Value::from(7)));
    }
}
