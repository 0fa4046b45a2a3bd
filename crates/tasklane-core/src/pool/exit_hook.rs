//! Close live pools at process exit.
//!
//! Pools are normally closed by their `PoolManager`, but a manager that is
//! leaked or stored in a static never drops. The hook below runs at normal
//! process exit and drains every pool that is still alive.

use std::sync::{Arc, Mutex, Once, Weak};

use super::WorkerPool;

static LIVE_POOLS: Mutex<Vec<Weak<WorkerPool>>> = Mutex::new(Vec::new());
static INSTALL: Once = Once::new();

/// Track a pool so it is closed at process exit.
pub(super) fn register(pool: &Arc<WorkerPool>) {
    INSTALL.call_once(|| {
        // SAFETY: `close_live_pools` is a plain extern "C" fn with no arguments.
        let rc = unsafe { libc::atexit(close_live_pools) };
        if rc != 0 {
            tracing::warn!("Could not register the pool exit hook");
        }
    });

    let mut pools = LIVE_POOLS.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    pools.retain(|weak| weak.strong_count() > 0);
    pools.push(Arc::downgrade(pool));
}

extern "C" fn close_live_pools() {
    let pools: Vec<Weak<WorkerPool>> = match LIVE_POOLS.lock() {
        Ok(mut pools) => pools.drain(..).collect(),
        Err(poisoned) => poisoned.into_inner().drain(..).collect(),
    };
    for pool in pools.iter().filter_map(Weak::upgrade) {
        if pool.is_open() {
            pool.close(false);
        }
    }
}
