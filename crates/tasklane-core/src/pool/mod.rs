//! Worker pool lifecycle.
//!
//! [`PoolManager`] owns at most one pool for its scope and is the only thing
//! that creates or tears it down:
//!
//! ```text
//! Uninitialized ──ensure/init──▶ Active(n) ──close──▶ Closed
//!        │                                              │
//!        └──init(1)──▶ SerialStub ──close──▶ Closed ◀───┘
//!                                              │
//!                      ensure/init ◀───────────┘
//! ```
//!
//! Re-initializing a live pool is a warning and a no-op. Closing is
//! idempotent. Live pools are also closed by `Drop` and by a process-exit
//! hook, so no worker outlives its parent.

mod dispatch;
mod exit_hook;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ipc::{find_worker_binary, in_worker_process};

pub(crate) use dispatch::{ChunkJob, UnitEvent};
pub use dispatch::WorkerPool;

/// Observable state of a [`PoolManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// No pool has been created yet.
    Uninitialized,
    /// Worker processes are running.
    Active(usize),
    /// One-worker configuration: no processes, every call runs in-process.
    SerialStub,
    /// The pool was closed.
    Closed,
}

enum PoolState {
    Uninitialized,
    Active(Arc<WorkerPool>),
    SerialStub,
    Closed,
}

/// What executors dispatch to.
#[derive(Clone)]
pub enum PoolHandle {
    /// Run in the calling process.
    Serial,
    /// Run on worker processes.
    Workers(Arc<WorkerPool>),
}

/// Owner of the pool for one logical scope.
pub struct PoolManager {
    config: EngineConfig,
    state: Mutex<PoolState>,
}

impl PoolManager {
    /// Create a manager; no pool is started until first use.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: Mutex::new(PoolState::Uninitialized),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current pool state.
    pub fn status(&self) -> PoolStatus {
        match &*self.lock_state() {
            PoolState::Uninitialized => PoolStatus::Uninitialized,
            PoolState::Active(pool) => PoolStatus::Active(pool.n_workers()),
            PoolState::SerialStub => PoolStatus::SerialStub,
            PoolState::Closed => PoolStatus::Closed,
        }
    }

    /// Number of workers of the live pool, if any.
    pub fn n_workers(&self) -> Option<usize> {
        match self.status() {
            PoolStatus::Active(n) => Some(n),
            PoolStatus::SerialStub => Some(1),
            PoolStatus::Uninitialized | PoolStatus::Closed => None,
        }
    }

    /// Make sure a pool exists, creating one with the default worker count.
    pub fn ensure_pool(&self, warn: bool) -> Result<PoolHandle> {
        let mut state = self.lock_state();
        if matches!(*state, PoolState::Uninitialized | PoolState::Closed) {
            if warn {
                tracing::warn!("Worker pool was not initialized; initializing with defaults");
            }
            *state = self.create(None, self.config.max_tasks_per_worker)?;
        }
        Ok(handle_of(&state))
    }

    /// Explicitly start the pool.
    ///
    /// `n_workers == Some(1)` selects the serial stub. Starting a pool from
    /// inside a worker process, or with zero workers, is a configuration error.
    pub fn init_pool(
        &self,
        n_workers: Option<usize>,
        max_tasks_per_worker: Option<usize>,
    ) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            PoolState::Active(_) | PoolState::SerialStub => {
                tracing::warn!(
                    "Worker pool is already initialized; close it before reinitializing"
                );
                Ok(())
            }
            PoolState::Uninitialized | PoolState::Closed => {
                let max_tasks = max_tasks_per_worker.or(self.config.max_tasks_per_worker);
                *state = self.create(n_workers, max_tasks)?;
                Ok(())
            }
        }
    }

    fn create(
        &self,
        n_workers: Option<usize>,
        max_tasks_per_worker: Option<usize>,
    ) -> Result<PoolState> {
        if in_worker_process() {
            return Err(Error::Config(
                "worker pools can only be initialized from the main process".to_string(),
            ));
        }
        let n_workers = n_workers.unwrap_or_else(|| self.config.default_num_procs());
        if n_workers == 0 {
            return Err(Error::Config("a pool needs at least one worker".to_string()));
        }
        if max_tasks_per_worker == Some(0) {
            return Err(Error::Config("max_tasks_per_worker must be at least 1".to_string()));
        }

        tracing::info!("Initializing worker pool with {} processes", n_workers);
        if n_workers == 1 {
            tracing::info!("Pool has a single worker; tasks will run serially in-process");
            return Ok(PoolState::SerialStub);
        }

        let worker_path = find_worker_binary(self.config.worker_path.as_deref())?;
        dispatch::check_worker_path(&worker_path)?;
        let pool = Arc::new(WorkerPool::start(n_workers, worker_path, max_tasks_per_worker)?);
        exit_hook::register(&pool);
        Ok(PoolState::Active(pool))
    }

    /// Close the pool, draining queued work unless `terminate` is set.
    ///
    /// Always waits for the workers to exit. Closing a closed pool is a no-op.
    pub fn close_pool(&self, terminate: bool) {
        let mut state = self.lock_state();
        match std::mem::replace(&mut *state, PoolState::Closed) {
            PoolState::Active(pool) => {
                if terminate {
                    tracing::info!("Terminating worker pool");
                } else {
                    tracing::info!("Closing worker pool");
                }
                pool.close(terminate);
            }
            PoolState::SerialStub => tracing::debug!("Closing serial pool"),
            PoolState::Uninitialized | PoolState::Closed => {}
        }
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.close_pool(false);
    }
}

fn handle_of(state: &PoolState) -> PoolHandle {
    match state {
        PoolState::Active(pool) => PoolHandle::Workers(pool.clone()),
        _ => PoolHandle::Serial,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serial_manager() -> PoolManager {
        PoolManager::new(EngineConfig::default().with_num_procs(1))
    }

    #[test]
    fn test_starts_uninitialized() {
        let manager = serial_manager();
        assert_eq!(manager.status(), PoolStatus::Uninitialized);
        assert_eq!(manager.n_workers(), None);
    }

    #[test]
    fn test_single_worker_is_serial_stub() {
        let manager = PoolManager::new(EngineConfig::default());
        manager.init_pool(Some(1), None).unwrap();
        assert_eq!(manager.status(), PoolStatus::SerialStub);
        assert_eq!(manager.n_workers(), Some(1));
        assert!(matches!(manager.ensure_pool(false).unwrap(), PoolHandle::Serial));
    }

    #[test]
    fn test_ensure_uses_configured_count() {
        let manager = serial_manager();
        assert!(matches!(manager.ensure_pool(true).unwrap(), PoolHandle::Serial));
        assert_eq!(manager.status(), PoolStatus::SerialStub);
    }

    #[test]
    fn test_reinit_is_noop() {
        let manager = serial_manager();
        manager.init_pool(Some(1), None).unwrap();
        // A different count is ignored while the pool is live.
        manager.init_pool(Some(8), None).unwrap();
        assert_eq!(manager.status(), PoolStatus::SerialStub);
    }

    #[test]
    fn test_zero_workers_is_config_error() {
        let manager = serial_manager();
        let err = manager.init_pool(Some(0), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(manager.status(), PoolStatus::Uninitialized);

        let err = manager.init_pool(Some(2), Some(0)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_configured_zero_workers_is_config_error() {
        let manager = PoolManager::new(
            EngineConfig::default()
                .with_num_procs(0)
                .with_worker_path("/bin/true"),
        );
        assert!(matches!(manager.ensure_pool(false), Err(Error::Config(_))));
        assert!(matches!(manager.init_pool(None, None), Err(Error::Config(_))));
        assert_eq!(manager.status(), PoolStatus::Uninitialized);
    }

    #[test]
    fn test_pool_refused_inside_worker() {
        if in_worker_process() {
            let manager = PoolManager::new(EngineConfig::default().with_worker_path("/bin/true"));
            assert!(matches!(manager.init_pool(Some(2), None), Err(Error::Config(_))));
            assert!(matches!(manager.ensure_pool(false), Err(Error::Config(_))));
            assert_eq!(manager.status(), PoolStatus::Uninitialized);
            return;
        }

        // Re-run this test alone in a child that carries the worker marker.
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args(["--exact", "pool::tests::test_pool_refused_inside_worker", "--test-threads=1"])
            .env(crate::ipc::WORKER_ENV_MARKER, "1")
            .output()
            .unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(output.status.success(), "{}", stdout);
        assert!(stdout.contains("1 passed"), "{}", stdout);
    }

    #[test]
    fn test_close_is_idempotent() {
        let manager = serial_manager();
        manager.close_pool(false);
        manager.close_pool(false);
        assert_eq!(manager.status(), PoolStatus::Closed);

        manager.init_pool(None, None).unwrap();
        manager.close_pool(false);
        manager.close_pool(false);
        manager.close_pool(true);
        assert_eq!(manager.status(), PoolStatus::Closed);
    }

    #[test]
    fn test_ensure_after_close_reinitializes() {
        let manager = serial_manager();
        manager.init_pool(None, None).unwrap();
        manager.close_pool(false);
        manager.ensure_pool(false).unwrap();
        assert_eq!(manager.status(), PoolStatus::SerialStub);
    }

    #[test]
    fn test_missing_worker_binary_is_config_error() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::default().with_worker_path(temp.path().join("missing-worker"));
        let manager = PoolManager::new(config);
        let err = manager.init_pool(Some(2), None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(manager.status(), PoolStatus::Uninitialized);
    }
}
