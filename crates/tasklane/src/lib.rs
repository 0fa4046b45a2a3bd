//! tasklane: parallel task execution over a pool of worker processes.
//!
//! This crate bundles the engine from `tasklane-core` with a library of
//! built-in tasks and two binaries:
//! - `tasklane` runs a built-in task over a range of inputs
//! - `tasklane-worker` is the worker process the pool spawns
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tasklane::{Engine, EngineConfig, GenerateOptions};
//!
//! let engine = Engine::new(tasklane::builtin::registry(), EngineConfig::from_env()?);
//! let args = (0..100).map(|x| (x,));
//! for square in engine.generate::<_, _, i64>("square", args, GenerateOptions::default())? {
//!     println!("{}", square?);
//! }
//! engine.close_pool(false);
//! ```
//!
//! A custom worker binary only has to build the same registry and call
//! [`serve_worker`].

pub mod builtin;

pub use tasklane_core::{
    BackgroundProcess, BackgroundThread, Engine, EngineConfig, Error, FallbackPolicy,
    GenerateOptions, Kwargs, LogProgress, PoolStatus, ProcessOptions, ProgressHandle,
    ProgressReporter, Result, SilentProgress, TaskRegistry, TaskStream, in_worker_process,
    serve_worker, spawn_background_thread, spawned_worker_count,
};
