//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use tasklane::{Engine, EngineConfig, SilentProgress};

/// Path of the worker binary built alongside the tests.
pub const WORKER: &str = env!("CARGO_BIN_EXE_tasklane-worker");

/// Engine over the built-in tasks with `num_procs` workers.
pub fn engine(num_procs: usize) -> Engine {
    engine_with(EngineConfig::default().with_num_procs(num_procs))
}

/// Engine over the built-in tasks with a custom configuration.
pub fn engine_with(config: EngineConfig) -> Engine {
    Engine::new(tasklane::builtin::registry(), config.with_worker_path(WORKER))
        .with_progress(SilentProgress)
}

/// `(x,)` argument tuples for `0..n`.
pub fn singles(n: i64) -> impl Iterator<Item = (i64,)> {
    (0..n).map(|x| (x,))
}
