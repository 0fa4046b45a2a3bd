//! Eager batch execution.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::unbounded;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{ChunkJob, PoolHandle, WorkerPool};
use crate::progress::Progress;
use crate::ipc::UnitPayload;
use crate::task::TaskUnit;

use super::{
    ProcessOptions, decode_result, kwargs_json, resolve_n_tasks, serial, unit_payload, unit_source,
};

impl Engine {
    /// Run `task` over every argument tuple and return the results in input order.
    ///
    /// Blocks until every unit is done. The first error in input order is
    /// returned; there is no fallback for batches.
    pub fn process<A, I, R>(&self, task: &str, args: I, options: ProcessOptions) -> Result<Vec<R>>
    where
        I: IntoIterator<Item = A>,
        A: Serialize,
        R: DeserializeOwned,
    {
        self.registry.require(task)?;
        let args = args.into_iter();
        let n_tasks = resolve_n_tasks(options.n_tasks, args.size_hint())?;
        let force_serial = options.force_serial.unwrap_or(self.config.force_serial);

        let task_name: Arc<str> = Arc::from(task);
        let kwargs = Arc::new(options.kwargs);
        let units: Vec<TaskUnit> =
            unit_source(task_name.clone(), kwargs.clone(), args, n_tasks).collect::<Result<_>>()?;

        let mut progress = Progress::begin(self.reporter(options.progress), n_tasks, task);
        let values = match self.dispatch_target(force_serial)? {
            PoolHandle::Serial => {
                tracing::debug!("Running {} '{}' tasks serially", n_tasks, task);
                serial::run_batch(&self.registry, &units, &mut progress)
            }
            PoolHandle::Workers(pool) => {
                tracing::debug!(
                    "Running {} '{}' tasks on {} worker processes",
                    n_tasks,
                    task,
                    pool.n_workers()
                );
                let kwargs_json = kwargs_json(&kwargs)?;
                run_parallel(&pool, task_name, kwargs_json, &units, &mut progress)
            }
        };
        progress.finish();

        values?
            .into_iter()
            .enumerate()
            .map(|(index, value)| decode_result(index, value))
            .collect()
    }
}

/// Submit one job per unit and wait for every completion event.
fn run_parallel(
    pool: &WorkerPool,
    task: Arc<str>,
    kwargs_json: Arc<Vec<u8>>,
    units: &[TaskUnit],
    progress: &mut Progress,
) -> Result<Vec<Value>> {
    let (events_tx, events_rx) = unbounded();
    let cancelled = Arc::new(AtomicBool::new(false));

    let make_job = |payload: UnitPayload| ChunkJob {
        task: task.clone(),
        kwargs_json: kwargs_json.clone(),
        units: vec![payload],
        events: events_tx.clone(),
        cancelled: cancelled.clone(),
    };
    queue_units(units, make_job, |job| pool.submit(job), &cancelled)?;
    // Only the queued jobs hold senders now; a disconnect means the pool went away.
    drop(events_tx);

    let mut outcomes: Vec<Option<Result<Value>>> = units.iter().map(|_| None).collect();
    for _ in 0..units.len() {
        let Ok(event) = events_rx.recv() else {
            break;
        };
        if let Some(slot) = outcomes.get_mut(event.index) {
            *slot = Some(event.outcome);
        }
        progress.advance();
    }

    outcomes
        .into_iter()
        .enumerate()
        .map(|(index, outcome)| {
            outcome.unwrap_or_else(|| {
                Err(Error::WorkerLost(format!("no result was reported for task {}", index)))
            })
        })
        .collect()
}

/// Queue one job per unit; on the first failure, cancel what was already queued.
fn queue_units(
    units: &[TaskUnit],
    make_job: impl Fn(UnitPayload) -> ChunkJob,
    mut submit: impl FnMut(ChunkJob) -> Result<()>,
    cancelled: &AtomicBool,
) -> Result<()> {
    for unit in units {
        if let Err(e) = unit_payload(unit).and_then(|payload| submit(make_job(payload))) {
            cancelled.store(true, Ordering::SeqCst);
            return Err(e);
        }
    }
    Ok(())
}
