//! Executors: apply one task to a sequence of argument tuples.
//!
//! # Executors
//!
//! - **`Engine::process`** - eager. Submits every unit, blocks until all are
//!   done, returns results in submission order.
//! - **`Engine::generate`** - lazy. Submits chunks while the caller iterates,
//!   yields results in input or completion order, and falls back to serial
//!   execution if the parallel path fails.
//!
//! # Architecture
//!
//! ```text
//! Engine::process / Engine::generate
//!     │
//!     ├── Serial: TaskRegistry::call in the calling process
//!     │
//!     └── Parallel: WorkerPool
//!             │
//!             ├── ChunkJob queue ──▶ dispatcher thread ──▶ worker process
//!             │
//!             └── UnitEvent completion channel ◀── one event per unit
//! ```

mod batch;
mod fallback;
mod serial;
mod stream;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ipc::UnitPayload;
use crate::task::{Kwargs, TaskUnit};

pub use fallback::FallbackPolicy;
pub use stream::TaskStream;

/// Options for [`Engine::process`](crate::Engine::process).
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Declared task count. Required when the argument source has no exact length.
    pub n_tasks: Option<usize>,
    /// Overrides `EngineConfig::force_serial` for this call.
    pub force_serial: Option<bool>,
    /// Keyword arguments applied to every unit.
    pub kwargs: Kwargs,
    /// Report progress.
    pub progress: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            n_tasks: None,
            force_serial: None,
            kwargs: Kwargs::new(),
            progress: true,
        }
    }
}

impl ProcessOptions {
    pub fn n_tasks(mut self, n_tasks: usize) -> Self {
        self.n_tasks = Some(n_tasks);
        self
    }

    pub fn force_serial(mut self, force_serial: bool) -> Self {
        self.force_serial = Some(force_serial);
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }
}

/// Options for [`Engine::generate`](crate::Engine::generate).
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Declared task count. Required when the argument source has no exact length.
    pub n_tasks: Option<usize>,
    /// Overrides `EngineConfig::force_serial` for this call.
    pub force_serial: Option<bool>,
    /// Keyword arguments applied to every unit.
    pub kwargs: Kwargs,
    /// Yield in input order (`true`) or completion order (`false`).
    pub ordered: bool,
    /// Units per dispatch. `None` picks `max(1, n_tasks / n_workers²)`.
    pub chunksize: Option<usize>,
    /// Report progress.
    pub progress: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            n_tasks: None,
            force_serial: None,
            kwargs: Kwargs::new(),
            ordered: true,
            chunksize: Some(1),
            progress: true,
        }
    }
}

impl GenerateOptions {
    pub fn n_tasks(mut self, n_tasks: usize) -> Self {
        self.n_tasks = Some(n_tasks);
        self
    }

    pub fn force_serial(mut self, force_serial: bool) -> Self {
        self.force_serial = Some(force_serial);
        self
    }

    pub fn kwargs(mut self, kwargs: Kwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    pub fn unordered(self) -> Self {
        self.ordered(false)
    }

    pub fn chunksize(mut self, chunksize: usize) -> Self {
        self.chunksize = Some(chunksize.max(1));
        self
    }

    pub fn auto_chunksize(mut self) -> Self {
        self.chunksize = None;
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }
}

/// Lazily built task units of one call.
pub(crate) type UnitSource<'a> = Box<dyn Iterator<Item = Result<TaskUnit>> + 'a>;

/// Turn an argument iterator into exactly `n_tasks` units.
///
/// A source that runs dry early ends with [`Error::TaskCount`].
pub(crate) fn unit_source<'a, A, I>(
    task: Arc<str>,
    kwargs: Arc<Kwargs>,
    args: I,
    n_tasks: usize,
) -> UnitSource<'a>
where
    I: Iterator<Item = A> + 'a,
    A: Serialize,
{
    Box::new(CountedUnits {
        args: args.take(n_tasks).enumerate(),
        task,
        kwargs,
        expected: n_tasks,
        produced: 0,
        finished: false,
    })
}

struct CountedUnits<I> {
    args: std::iter::Enumerate<std::iter::Take<I>>,
    task: Arc<str>,
    kwargs: Arc<Kwargs>,
    expected: usize,
    produced: usize,
    finished: bool,
}

impl<A: Serialize, I: Iterator<Item = A>> Iterator for CountedUnits<I> {
    type Item = Result<TaskUnit>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.args.next() {
            Some((index, args)) => {
                self.produced += 1;
                Some(TaskUnit::new(index, self.task.clone(), &args, self.kwargs.clone()))
            }
            None => {
                self.finished = true;
                (self.produced < self.expected).then(|| {
                    Err(Error::TaskCount {
                        expected: self.expected,
                        actual: self.produced,
                    })
                })
            }
        }
    }
}

/// Declared count, or the exact length of the source.
pub(crate) fn resolve_n_tasks(
    declared: Option<usize>,
    size_hint: (usize, Option<usize>),
) -> Result<usize> {
    match (declared, size_hint) {
        (Some(n), _) => Ok(n),
        (None, (lower, Some(upper))) if lower == upper => Ok(lower),
        (None, _) => Err(Error::Config(
            "n_tasks must be declared when the argument source has no exact length".to_string(),
        )),
    }
}

/// Chunk size that amortizes dispatch without starving progress.
pub(crate) fn auto_chunksize(n_tasks: usize, n_workers: usize) -> usize {
    let denominator = n_workers.saturating_mul(n_workers).max(1);
    (n_tasks / denominator).max(1)
}

pub(crate) fn unit_payload(unit: &TaskUnit) -> Result<UnitPayload> {
    let args_json = serde_json::to_vec(&unit.args).map_err(|e| {
        Error::Serialization(format!(
            "Failed to encode arguments of task {}: {}",
            unit.index, e
        ))
    })?;
    Ok(UnitPayload {
        index: unit.index,
        args_json,
    })
}

pub(crate) fn kwargs_json(kwargs: &Kwargs) -> Result<Arc<Vec<u8>>> {
    serde_json::to_vec(kwargs)
        .map(Arc::new)
        .map_err(|e| Error::Serialization(format!("Failed to encode keyword arguments: {}", e)))
}

pub(crate) fn decode_result<R: DeserializeOwned>(index: usize, value: Value) -> Result<R> {
    serde_json::from_value(value).map_err(|e| {
        Error::Serialization(format!(
            "Result of task {} has an unexpected type: {}",
            index, e
        ))
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Registry shared by executor tests.

    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::task::TaskRegistry;

    pub(crate) fn registry(calls: &'static AtomicUsize) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("square", move |(x,): (i64,)| {
                calls.fetch_add(1, Ordering::SeqCst);
                x * x
            })
            .register_fallible("fail_on", |(x, bad): (i64, i64)| {
                if x == bad {
                    Err(format!("refusing {}", x))
                } else {
                    Ok(x)
                }
            });
        registry
    }
}
