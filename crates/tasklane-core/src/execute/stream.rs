//! Lazy, chunked streaming execution.
//!
//! A [`TaskStream`] pulls argument tuples from its source only as fast as the
//! pool can absorb them: at most `2 × n_workers` chunks are outstanding at any
//! time. Results are yielded in input order (reassembled through a
//! `next_expected` index) or in completion order.
//!
//! When the parallel path fails the stream can switch, once, to in-process
//! execution of everything it has not yielded yet. See [`FallbackPolicy`].

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::pool::{ChunkJob, PoolHandle, UnitEvent, WorkerPool};
use crate::progress::Progress;
use crate::task::{TaskRegistry, TaskUnit};

use super::fallback::{self, FallbackPolicy};
use super::serial::SerialRun;
use super::{
    GenerateOptions, UnitSource, auto_chunksize, decode_result, kwargs_json, resolve_n_tasks,
    unit_payload, unit_source,
};

impl Engine {
    /// Run `task` over the argument tuples lazily, yielding results as they come.
    ///
    /// Nothing is submitted until the stream is iterated. Dropping the stream
    /// cancels chunks that have not started yet.
    pub fn generate<'a, A, I, R>(
        &self,
        task: &str,
        args: I,
        options: GenerateOptions,
    ) -> Result<TaskStream<'a, R>>
    where
        I: IntoIterator<Item = A>,
        I::IntoIter: 'a,
        A: Serialize,
        R: DeserializeOwned,
    {
        self.registry.require(task)?;
        let args = args.into_iter();
        let n_tasks = resolve_n_tasks(options.n_tasks, args.size_hint())?;
        let force_serial = options.force_serial.unwrap_or(self.config.force_serial);

        let task_name: Arc<str> = Arc::from(task);
        let kwargs = Arc::new(options.kwargs);
        let pool = if n_tasks == 0 || n_tasks == 1 || force_serial {
            PoolHandle::Serial
        } else {
            self.dispatch_target(false)?
        };

        let state = match pool {
            _ if n_tasks == 0 => StreamState::Done,
            PoolHandle::Serial => {
                tracing::debug!("Streaming {} '{}' tasks serially", n_tasks, task);
                let source = unit_source(task_name.clone(), kwargs, args, n_tasks);
                StreamState::Serial(SerialRun::new(self.registry.clone(), source))
            }
            PoolHandle::Workers(pool) => {
                let chunksize = options
                    .chunksize
                    .unwrap_or_else(|| auto_chunksize(n_tasks, pool.n_workers()));
                tracing::debug!(
                    "Streaming {} '{}' tasks on {} worker processes (chunksize {}, ordered {})",
                    n_tasks,
                    task,
                    pool.n_workers(),
                    chunksize,
                    options.ordered
                );
                let run = ParallelRun::new(
                    pool,
                    task_name.clone(),
                    kwargs_json(&kwargs)?,
                    chunksize,
                    options.ordered,
                );
                StreamState::Parallel {
                    run: Box::new(run),
                    source: unit_source(task_name.clone(), kwargs, args, n_tasks),
                }
            }
        };

        let mut stream = TaskStream {
            state,
            task: task_name,
            registry: self.registry.clone(),
            policy: FallbackPolicy::from_config(&self.config),
            progress: Progress::begin(self.reporter(options.progress), n_tasks, task),
            timer: self.config.time_generate.then(Instant::now),
            _result: PhantomData,
        };
        if n_tasks == 0 {
            stream.finish();
        }
        Ok(stream)
    }
}

/// One step of a stream.
pub(crate) enum Step {
    /// A result ready to be yielded.
    Yield(usize, Value),
    /// The parallel path failed; the remainder may be re-run serially.
    ParallelFailure(Error),
    /// A failure that ends the stream.
    Fail(Error),
}

/// Parallel half of a stream.
pub(crate) trait ParallelSource {
    /// Next result, pulling more units from `source` as capacity frees up.
    fn next_step(&mut self, source: &mut UnitSource<'_>) -> Option<Step>;

    /// Units taken from the source whose results were not yielded, in index
    /// order. Cancels everything still queued.
    fn take_unyielded(&mut self) -> Vec<TaskUnit>;
}

enum StreamState<'a> {
    Serial(SerialRun<'a>),
    Parallel {
        run: Box<dyn ParallelSource + 'a>,
        source: UnitSource<'a>,
    },
    Done,
}

/// Lazily produced results of [`Engine::generate`].
///
/// Yields `Result<R>`; after the first error the stream is fused. The
/// stream is finite and cannot be restarted.
pub struct TaskStream<'a, R> {
    state: StreamState<'a>,
    task: Arc<str>,
    registry: Arc<TaskRegistry>,
    policy: FallbackPolicy,
    progress: Progress,
    timer: Option<Instant>,
    _result: PhantomData<fn() -> R>,
}

impl<R> TaskStream<'_, R> {
    /// Whether the stream switched to (or started on) in-process execution.
    pub fn is_serial(&self) -> bool {
        matches!(self.state, StreamState::Serial(_))
    }

    fn step(&mut self) -> Option<Step> {
        match &mut self.state {
            StreamState::Done => None,
            StreamState::Serial(run) => run.next().map(|result| match result {
                Ok((index, value)) => Step::Yield(index, value),
                Err(e) => Step::Fail(e),
            }),
            StreamState::Parallel { run, source } => run.next_step(source),
        }
    }

    fn fall_back(&mut self, error: &Error) {
        let cause = if error.is_infrastructure() {
            "worker pool failure"
        } else {
            "task failure"
        };
        tracing::error!(
            "Parallel execution of '{}' failed ({}): {}",
            self.task,
            cause,
            error
        );
        tracing::warn!("Falling back to serial execution for the remaining '{}' tasks", self.task);
        if let StreamState::Parallel { mut run, source } =
            std::mem::replace(&mut self.state, StreamState::Done)
        {
            let unyielded = run.take_unyielded();
            drop(run);
            self.state = StreamState::Serial(SerialRun::new(
                self.registry.clone(),
                fallback::remainder(unyielded, source),
            ));
        }
    }

    fn finish(&mut self) {
        self.state = StreamState::Done;
        self.progress.finish();
        if let Some(started) = self.timer.take() {
            tracing::info!("Stream of '{}' took {:.3?}", self.task, started.elapsed());
        }
    }
}

impl<R: DeserializeOwned> Iterator for TaskStream<'_, R> {
    type Item = Result<R>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.step() {
                Some(Step::Yield(index, value)) => {
                    self.progress.advance();
                    let decoded = decode_result(index, value);
                    if decoded.is_err() {
                        self.finish();
                    }
                    return Some(decoded);
                }
                Some(Step::ParallelFailure(error)) => match self.policy {
                    FallbackPolicy::Serial => self.fall_back(&error),
                    FallbackPolicy::Propagate => {
                        self.finish();
                        return Some(Err(error));
                    }
                },
                Some(Step::Fail(error)) => {
                    self.finish();
                    return Some(Err(error));
                }
                None => {
                    if !matches!(self.state, StreamState::Done) {
                        self.finish();
                    }
                    return None;
                }
            }
        }
    }
}

/// Pool-backed [`ParallelSource`].
struct ParallelRun {
    pool: Arc<WorkerPool>,
    task: Arc<str>,
    kwargs_json: Arc<Vec<u8>>,
    chunksize: usize,
    /// Upper bound on units submitted but not completed.
    capacity: usize,
    ordered: bool,
    events_tx: Sender<UnitEvent>,
    events_rx: Receiver<UnitEvent>,
    cancelled: Arc<AtomicBool>,
    /// Units taken from the source whose results were not yielded yet.
    in_flight: BTreeMap<usize, TaskUnit>,
    /// Completed results waiting for their turn (ordered mode).
    ready: BTreeMap<usize, Value>,
    next_expected: usize,
    /// Units submitted whose completion event has not arrived.
    outstanding: usize,
    source_done: bool,
    source_error: Option<Error>,
}

impl ParallelRun {
    fn new(
        pool: Arc<WorkerPool>,
        task: Arc<str>,
        kwargs_json: Arc<Vec<u8>>,
        chunksize: usize,
        ordered: bool,
    ) -> Self {
        let chunksize = chunksize.max(1);
        let (events_tx, events_rx) = unbounded();
        Self {
            capacity: 2 * pool.n_workers().max(1) * chunksize,
            pool,
            task,
            kwargs_json,
            chunksize,
            ordered,
            events_tx,
            events_rx,
            cancelled: Arc::new(AtomicBool::new(false)),
            in_flight: BTreeMap::new(),
            ready: BTreeMap::new(),
            next_expected: 0,
            outstanding: 0,
            source_done: false,
            source_error: None,
        }
    }

    /// Submit chunks until the pool is saturated or the source is exhausted.
    fn top_up(&mut self, source: &mut UnitSource<'_>) -> Result<()> {
        while !self.source_done
            && self.source_error.is_none()
            && self.outstanding + self.chunksize <= self.capacity
        {
            let mut payloads = Vec::with_capacity(self.chunksize);
            while payloads.len() < self.chunksize {
                match source.next() {
                    Some(Ok(unit)) => match unit_payload(&unit) {
                        Ok(payload) => {
                            payloads.push(payload);
                            self.in_flight.insert(unit.index, unit);
                        }
                        Err(e) => {
                            self.source_error = Some(e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        self.source_error = Some(e);
                        break;
                    }
                    None => {
                        self.source_done = true;
                        break;
                    }
                }
            }
            if payloads.is_empty() {
                break;
            }

            let count = payloads.len();
            self.pool.submit(ChunkJob {
                task: self.task.clone(),
                kwargs_json: self.kwargs_json.clone(),
                units: payloads,
                events: self.events_tx.clone(),
                cancelled: self.cancelled.clone(),
            })?;
            self.outstanding += count;
        }
        Ok(())
    }
}

impl ParallelSource for ParallelRun {
    fn next_step(&mut self, source: &mut UnitSource<'_>) -> Option<Step> {
        loop {
            if self.ordered {
                if let Some(value) = self.ready.remove(&self.next_expected) {
                    let index = self.next_expected;
                    self.in_flight.remove(&index);
                    self.next_expected += 1;
                    return Some(Step::Yield(index, value));
                }
            }

            if let Err(e) = self.top_up(source) {
                return Some(Step::ParallelFailure(e));
            }

            if self.outstanding == 0 {
                return self.source_error.take().map(Step::Fail);
            }

            // We hold a sender ourselves, so this only returns once a unit completes.
            let Ok(event) = self.events_rx.recv() else {
                return Some(Step::ParallelFailure(Error::PoolClosed));
            };
            self.outstanding = self.outstanding.saturating_sub(1);
            match event.outcome {
                Ok(value) if self.ordered => {
                    self.ready.insert(event.index, value);
                }
                Ok(value) => {
                    self.in_flight.remove(&event.index);
                    return Some(Step::Yield(event.index, value));
                }
                Err(e) => return Some(Step::ParallelFailure(e)),
            }
        }
    }

    fn take_unyielded(&mut self) -> Vec<TaskUnit> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.ready.clear();
        self.outstanding = 0;
        std::mem::take(&mut self.in_flight).into_values().collect()
    }
}

impl Drop for ParallelRun {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}
