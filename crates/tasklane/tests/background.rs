//! Background process and thread spawners.

mod common;

use std::fs;
use std::time::Duration;

use tasklane::{PoolStatus, spawn_background_thread};
use tempfile::TempDir;

use common::engine;

#[test]
fn test_background_process_runs_task() {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let path = temp.path().join("out.txt");
    let engine = engine(2);

    let mut process = engine
        .spawn_background_process("write_file", &(path.to_string_lossy(), "hello", 0))
        .unwrap();
    assert!(process.pid() > 0);
    assert!(process.wait().unwrap());

    assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    assert!(!process.is_alive());
    // Independent of the pool.
    assert_eq!(engine.pool_status(), PoolStatus::Uninitialized);
}

#[test]
fn test_background_process_can_be_killed() {
    let temp = TempDir::new().expect("Failed to create temp directory");
    let path = temp.path().join("never.txt");
    let engine = engine(2);

    let mut process = engine
        .spawn_background_process("write_file", &(path.to_string_lossy(), "late", 30_000))
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert!(process.is_alive());

    process.kill().unwrap();
    assert!(!process.is_alive());
    assert!(!path.exists());
}

#[test]
fn test_background_thread_outlives_pool() {
    let engine = engine(2);
    engine.init_pool(None, None).unwrap();

    let thread = spawn_background_thread(|| {
        std::thread::sleep(Duration::from_millis(200));
        "done"
    })
    .unwrap();
    engine.close_pool(true);

    assert_eq!(thread.join().unwrap(), "done");
}
