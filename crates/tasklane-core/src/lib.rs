//! Core engine for tasklane parallel task execution.
//!
//! This crate provides:
//! - A bounded pool of persistent worker processes with explicit lifecycle
//! - Batch execution (`Engine::process`)
//! - Lazy streaming execution with chunking and ordering (`Engine::generate`)
//! - One-shot serial fallback when the parallel path fails
//! - Progress reporting through a collaborator trait
//! - Background thread and process spawners
//! - The worker-side command loop (`serve_worker`)

pub mod config;
pub mod engine;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod pool;
pub mod progress;
pub mod serve;
pub mod spawn;
pub mod task;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use execute::{FallbackPolicy, GenerateOptions, ProcessOptions, TaskStream};
pub use ipc::{in_worker_process, spawned_worker_count};
pub use pool::{PoolHandle, PoolManager, PoolStatus, WorkerPool};
pub use progress::{LogProgress, ProgressHandle, ProgressReporter, SilentProgress};
pub use serve::serve_worker;
pub use spawn::{BackgroundProcess, BackgroundThread, spawn_background_thread};
pub use task::{Kwargs, TaskRegistry, TaskUnit, encode_args, encode_kwargs};
