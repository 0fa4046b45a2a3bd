//! Worker processes and their dispatcher threads.
//!
//! Each worker process is owned by one dispatcher thread in the parent. The
//! dispatchers share a job queue; a job is a chunk of units of one task. Every
//! finished unit is posted as a [`UnitEvent`] on the completion channel that
//! came with its job.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, unbounded};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::ipc::{UnitPayload, WorkerHandle, WorkerKillHandle, WorkerResponse};

/// A chunk of units submitted to the pool.
pub(crate) struct ChunkJob {
    pub task: Arc<str>,
    pub kwargs_json: Arc<Vec<u8>>,
    pub units: Vec<UnitPayload>,
    pub events: Sender<UnitEvent>,
    /// Set when the submitter no longer wants results; unstarted jobs are skipped.
    pub cancelled: Arc<AtomicBool>,
}

/// Completion of one unit.
#[derive(Debug)]
pub(crate) struct UnitEvent {
    pub index: usize,
    pub outcome: Result<Value>,
}

impl UnitEvent {
    fn from_response(response: WorkerResponse) -> Result<Self> {
        match response {
            WorkerResponse::Output { index, value_json } => Ok(Self {
                index,
                outcome: serde_json::from_slice(&value_json).map_err(|e| {
                    Error::Serialization(format!(
                        "Failed to decode result of task {}: {}",
                        index, e
                    ))
                }),
            }),
            WorkerResponse::Error { index, message } => Ok(Self {
                index,
                outcome: Err(Error::Task { index, message }),
            }),
            WorkerResponse::Panic { index, message } => Ok(Self {
                index,
                outcome: Err(Error::TaskPanicked { index, message }),
            }),
            other => Err(Error::Ipc(format!(
                "Unexpected response while running a chunk: {:?}",
                other
            ))),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Set of persistent worker processes driven by dispatcher threads.
pub struct WorkerPool {
    n_workers: usize,
    /// Job queue; `None` once the pool is closing.
    jobs: Mutex<Option<Sender<ChunkJob>>>,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
    /// Kill handle of the worker each dispatcher currently owns.
    kill_slots: Arc<Mutex<Vec<Option<WorkerKillHandle>>>>,
    terminating: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `n_workers` worker processes and their dispatcher threads.
    ///
    /// Workers are spawned eagerly; if any spawn fails, the ones already
    /// started are killed and the error is returned.
    pub fn start(
        n_workers: usize,
        worker_path: PathBuf,
        max_tasks_per_worker: Option<usize>,
    ) -> Result<Self> {
        let mut workers = Vec::with_capacity(n_workers);
        for _ in 0..n_workers {
            workers.push(WorkerHandle::spawn(&worker_path)?);
        }

        let (jobs_tx, jobs_rx) = unbounded::<ChunkJob>();
        let kill_slots = Arc::new(Mutex::new(
            workers.iter().map(|w| Some(WorkerKillHandle::new(w))).collect::<Vec<_>>(),
        ));
        let terminating = Arc::new(AtomicBool::new(false));

        let mut dispatchers = Vec::with_capacity(n_workers);
        for (slot, worker) in workers.into_iter().enumerate() {
            let dispatcher = Dispatcher {
                slot,
                worker: Some(worker),
                worker_path: worker_path.clone(),
                max_tasks_per_worker,
                jobs: jobs_rx.clone(),
                kill_slots: kill_slots.clone(),
                terminating: terminating.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("tasklane-dispatch-{}", slot))
                .spawn(move || dispatcher.run())?;
            dispatchers.push(handle);
        }

        Ok(Self {
            n_workers,
            jobs: Mutex::new(Some(jobs_tx)),
            dispatchers: Mutex::new(dispatchers),
            kill_slots,
            terminating,
        })
    }

    /// Number of worker processes.
    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Whether the pool still accepts jobs.
    pub fn is_open(&self) -> bool {
        lock(&self.jobs).is_some()
    }

    /// Queue a chunk. Never blocks.
    pub(crate) fn submit(&self, job: ChunkJob) -> Result<()> {
        match lock(&self.jobs).as_ref() {
            Some(jobs) => jobs.send(job).map_err(|_| Error::PoolClosed),
            None => Err(Error::PoolClosed),
        }
    }

    /// Stop accepting jobs and wait for every worker to exit.
    ///
    /// With `terminate`, workers are killed at once and queued jobs are
    /// rejected with [`Error::PoolClosed`]; otherwise the queue is drained
    /// first. Either way every dispatcher is joined and every child reaped.
    pub fn close(&self, terminate: bool) {
        let jobs = lock(&self.jobs).take();

        if terminate {
            self.terminating.store(true, Ordering::SeqCst);
            for kill in lock(&self.kill_slots).iter().flatten() {
                kill.kill();
            }
        }

        // Dispatchers exit once the queue is empty and disconnected.
        drop(jobs);

        let dispatchers: Vec<_> = lock(&self.dispatchers).drain(..).collect();
        for handle in dispatchers {
            if handle.join().is_err() {
                tracing::warn!("A dispatcher thread panicked during pool shutdown");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close(false);
    }
}

/// Owns one worker process and feeds it jobs from the shared queue.
struct Dispatcher {
    slot: usize,
    worker: Option<WorkerHandle>,
    worker_path: PathBuf,
    max_tasks_per_worker: Option<usize>,
    jobs: Receiver<ChunkJob>,
    kill_slots: Arc<Mutex<Vec<Option<WorkerKillHandle>>>>,
    terminating: Arc<AtomicBool>,
}

impl Dispatcher {
    fn run(mut self) {
        while let Ok(job) = self.jobs.recv() {
            if self.terminating.load(Ordering::SeqCst) {
                reject(&job, 0, || Error::PoolClosed);
                continue;
            }
            if job.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            self.run_job(job);
        }

        if let Some(worker) = self.worker.take() {
            self.set_kill_slot(None);
            if self.terminating.load(Ordering::SeqCst) {
                drop(worker);
            } else if let Err(e) = worker.shutdown() {
                tracing::warn!("Worker did not shut down cleanly: {}", e);
            }
        }
    }

    fn run_job(&mut self, job: ChunkJob) {
        let mut worker = match self.worker.take() {
            Some(worker) => worker,
            None => match self.respawn() {
                Ok(worker) => worker,
                Err(e) => {
                    let message = format!("could not start a worker: {}", e);
                    reject(&job, 0, || Error::WorkerLost(message.clone()));
                    return;
                }
            },
        };

        let unit_count = job.units.len();
        let first_index = job.units.first().map(|u| u.index).unwrap_or_default();
        let indices: Vec<usize> = job.units.iter().map(|u| u.index).collect();

        if let Err(e) = worker.start_chunk(&job.task, &job.kwargs_json, job.units.clone()) {
            self.lose_worker(worker, &job, &indices, 0, e);
            return;
        }

        for position in 0..unit_count {
            let event = worker.recv_response().and_then(UnitEvent::from_response);
            match event {
                Ok(event) => {
                    let _ = job.events.send(event);
                }
                Err(e) => {
                    self.lose_worker(worker, &job, &indices, position, e);
                    return;
                }
            }
        }

        let completed = worker.record_completed(unit_count);
        match self.max_tasks_per_worker {
            Some(max) if completed >= max => {
                tracing::debug!(
                    "Recycling worker {} after {} tasks (chunk starting at {})",
                    worker.pid(),
                    completed,
                    first_index
                );
                self.set_kill_slot(None);
                if let Err(e) = worker.shutdown() {
                    tracing::warn!("Recycled worker did not shut down cleanly: {}", e);
                }
            }
            _ => self.worker = Some(worker),
        }
    }

    /// Report the unfinished units of a chunk as lost and discard the worker.
    fn lose_worker(
        &mut self,
        mut worker: WorkerHandle,
        job: &ChunkJob,
        indices: &[usize],
        from: usize,
        cause: Error,
    ) {
        let pid = worker.pid();
        let terminating = self.terminating.load(Ordering::SeqCst);
        if !terminating {
            tracing::warn!("Worker {} failed while running '{}': {}", pid, job.task, cause);
        }
        // The slot must be empty before the child is reaped and its pid freed.
        self.set_kill_slot(None);
        let _ = worker.kill();

        for &index in &indices[from..] {
            let error = if terminating {
                Error::PoolClosed
            } else {
                Error::WorkerLost(format!(
                    "worker {} exited while running task {}: {}",
                    pid, index, cause
                ))
            };
            let _ = job.events.send(UnitEvent {
                index,
                outcome: Err(error),
            });
        }
    }

    fn respawn(&mut self) -> Result<WorkerHandle> {
        let worker = WorkerHandle::spawn(&self.worker_path)?;
        tracing::debug!("Dispatcher {} started worker {}", self.slot, worker.pid());
        self.set_kill_slot(Some(WorkerKillHandle::new(&worker)));
        if self.terminating.load(Ordering::SeqCst) {
            // Lost the race with terminate; the slot was already swept.
            self.set_kill_slot(None);
            let mut worker = worker;
            let _ = worker.kill();
            return Err(Error::PoolClosed);
        }
        Ok(worker)
    }

    fn set_kill_slot(&self, kill: Option<WorkerKillHandle>) {
        if let Some(slot) = lock(&self.kill_slots).get_mut(self.slot) {
            *slot = kill;
        }
    }
}

/// Fail every unit of `job` from position `from` on.
fn reject(job: &ChunkJob, from: usize, error: impl Fn() -> Error) {
    for unit in &job.units[from..] {
        let _ = job.events.send(UnitEvent {
            index: unit.index,
            outcome: Err(error()),
        });
    }
}

/// Path check used before starting a pool, so a missing binary is a
/// configuration error rather than a spawn failure.
pub(crate) fn check_worker_path(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "worker binary does not exist: {}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unit_event_from_response() {
        let event = UnitEvent::from_response(WorkerResponse::Output {
            index: 2,
            value_json: b"[1,2]".to_vec(),
        })
        .unwrap();
        assert_eq!(event.index, 2);
        assert_eq!(event.outcome.unwrap(), json!([1, 2]));

        let event = UnitEvent::from_response(WorkerResponse::Error {
            index: 5,
            message: "boom".into(),
        })
        .unwrap();
        assert!(matches!(event.outcome, Err(Error::Task { index: 5, .. })));

        let event = UnitEvent::from_response(WorkerResponse::Panic {
            index: 6,
            message: "kaboom".into(),
        })
        .unwrap();
        assert!(matches!(event.outcome, Err(Error::TaskPanicked { index: 6, .. })));

        assert!(matches!(
            UnitEvent::from_response(WorkerResponse::Pong),
            Err(Error::Ipc(_))
        ));
    }

    #[test]
    fn test_reject_sends_one_event_per_unit() {
        let (tx, rx) = unbounded();
        let job = ChunkJob {
            task: Arc::from("square"),
            kwargs_json: Arc::new(b"{}".to_vec()),
            units: (0..4)
                .map(|index| UnitPayload { index, args_json: b"[0]".to_vec() })
                .collect(),
            events: tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        reject(&job, 1, || Error::PoolClosed);
        drop(job);

        let indices: Vec<usize> = rx.iter().map(|event| event.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[cfg(unix)]
    #[test]
    fn test_lost_worker_is_unregistered_and_reported() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let worker = WorkerHandle::from_child(child).unwrap();
        let kill_slots = Arc::new(Mutex::new(vec![Some(WorkerKillHandle::new(&worker))]));
        let (_jobs_tx, jobs_rx) = unbounded();
        let mut dispatcher = Dispatcher {
            slot: 0,
            worker: None,
            worker_path: PathBuf::from("sleep"),
            max_tasks_per_worker: None,
            jobs: jobs_rx,
            kill_slots: kill_slots.clone(),
            terminating: Arc::new(AtomicBool::new(false)),
        };

        let (tx, rx) = unbounded();
        let job = ChunkJob {
            task: Arc::from("square"),
            kwargs_json: Arc::new(b"{}".to_vec()),
            units: (0..3)
                .map(|index| UnitPayload { index, args_json: b"[0]".to_vec() })
                .collect(),
            events: tx,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        dispatcher.lose_worker(worker, &job, &[0, 1, 2], 1, Error::Ipc("pipe closed".into()));
        drop(job);

        assert!(kill_slots.lock().unwrap()[0].is_none());
        let events: Vec<UnitEvent> = rx.iter().collect();
        assert_eq!(events.iter().map(|e| e.index).collect::<Vec<_>>(), vec![1, 2]);
        assert!(events.iter().all(|e| matches!(e.outcome, Err(Error::WorkerLost(_)))));
    }

    #[test]
    fn test_start_fails_without_binary() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("no-such-worker");
        assert!(check_worker_path(&missing).is_err());
        assert!(WorkerPool::start(2, missing, None).is_err());
    }
}
