//! The engine context.
//!
//! An [`Engine`] bundles the configuration, the task registry, the pool
//! manager and the progress reporter. Executors are methods on it, so every
//! call sees the same pool without any hidden global state.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::error::Result;
use crate::pool::{PoolHandle, PoolManager, PoolStatus};
use crate::progress::{LogProgress, ProgressReporter};
use crate::task::TaskRegistry;

/// Parallel task-execution engine for one logical scope.
///
/// Dropping the engine closes its pool (draining queued work).
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) registry: Arc<TaskRegistry>,
    pub(crate) pool: PoolManager,
    pub(crate) progress: Arc<dyn ProgressReporter>,
}

impl Engine {
    /// Create an engine. No worker is started until the first parallel call.
    pub fn new(registry: TaskRegistry, config: EngineConfig) -> Self {
        Self {
            pool: PoolManager::new(config.clone()),
            config,
            registry: Arc::new(registry),
            progress: Arc::new(LogProgress),
        }
    }

    /// Use a different progress reporter.
    pub fn with_progress(mut self, reporter: impl ProgressReporter + 'static) -> Self {
        self.progress = Arc::new(reporter);
        self
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Registered tasks.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// The pool manager.
    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// See [`PoolManager::ensure_pool`].
    pub fn ensure_pool(&self, warn: bool) -> Result<()> {
        self.pool.ensure_pool(warn).map(|_| ())
    }

    /// See [`PoolManager::init_pool`].
    pub fn init_pool(
        &self,
        n_workers: Option<usize>,
        max_tasks_per_worker: Option<usize>,
    ) -> Result<()> {
        self.pool.init_pool(n_workers, max_tasks_per_worker)
    }

    /// See [`PoolManager::close_pool`].
    pub fn close_pool(&self, terminate: bool) {
        self.pool.close_pool(terminate)
    }

    /// Current pool state.
    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Pool to dispatch to, or `Serial` when the call must not touch the pool.
    pub(crate) fn dispatch_target(&self, force_serial: bool) -> Result<PoolHandle> {
        if force_serial {
            return Ok(PoolHandle::Serial);
        }
        self.pool.ensure_pool(false)
    }

    pub(crate) fn reporter(&self, enabled: bool) -> Option<&dyn ProgressReporter> {
        enabled.then_some(self.progress.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::SilentProgress;

    #[test]
    fn test_engine_defaults() {
        let engine = Engine::new(TaskRegistry::new(), EngineConfig::default())
            .with_progress(SilentProgress);
        assert_eq!(engine.pool_status(), PoolStatus::Uninitialized);
        assert!(engine.registry().names().is_empty());
        assert!(engine.config().serial_fallback);
    }

    #[test]
    fn test_force_serial_does_not_touch_pool() {
        let engine = Engine::new(TaskRegistry::new(), EngineConfig::default());
        assert!(matches!(engine.dispatch_target(true).unwrap(), PoolHandle::Serial));
        assert_eq!(engine.pool_status(), PoolStatus::Uninitialized);
    }

    #[test]
    fn test_pool_delegation() {
        let engine = Engine::new(TaskRegistry::new(), EngineConfig::default().with_num_procs(1));
        engine.ensure_pool(false).unwrap();
        assert_eq!(engine.pool_status(), PoolStatus::SerialStub);
        engine.close_pool(false);
        engine.close_pool(false);
        assert_eq!(engine.pool_status(), PoolStatus::Closed);
    }
}
