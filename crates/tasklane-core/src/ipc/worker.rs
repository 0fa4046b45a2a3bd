//! Parent-side handles to tasklane worker processes.
//!
//! Provides `WorkerHandle` for spawning and communicating with a worker
//! process, and `WorkerKillHandle` for killing one from another thread.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::config::ENV_WORKER_PATH;
use crate::error::{Error, Result};

use super::protocol::{UnitPayload, WorkerCommand, WorkerResponse, read_message, write_message};

/// Environment marker set on every spawned worker process.
pub const WORKER_ENV_MARKER: &str = "TASKLANE_WORKER";

const WORKER_BINARY: &str = if cfg!(windows) {
    "tasklane-worker.exe"
} else {
    "tasklane-worker"
};

static SPAWNED_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Number of worker processes this process has spawned so far.
pub fn spawned_worker_count() -> usize {
    SPAWNED_WORKERS.load(Ordering::SeqCst)
}

/// Whether the current process is a tasklane worker.
pub fn in_worker_process() -> bool {
    std::env::var_os(WORKER_ENV_MARKER).is_some()
}

/// Find the tasklane-worker binary path.
///
/// Looks in the following order:
/// 1. The explicitly configured path
/// 2. `TASKLANE_WORKER_PATH` environment variable
/// 3. Same directory as the current executable (and its parent, for test binaries in `deps/`)
/// 4. System PATH
/// 5. `target/{debug,release}` relative to `CARGO_MANIFEST_DIR`
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Config(format!(
            "configured worker binary does not exist: {}",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var(ENV_WORKER_PATH) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe() {
        for dir in exe_path.ancestors().skip(1).take(2) {
            let worker_path = dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Config(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        WORKER_BINARY, ENV_WORKER_PATH
    )))
}

/// Handle to a worker process.
///
/// Provides methods to send commands, receive responses, and kill the process.
pub struct WorkerHandle {
    /// The child process.
    child: Child,
    /// Buffered stdin writer.
    stdin: BufWriter<std::process::ChildStdin>,
    /// Buffered stdout reader.
    stdout: BufReader<std::process::ChildStdout>,
    /// Whether the worker has been killed.
    killed: bool,
    /// Units completed by this worker, for recycling.
    completed_units: usize,
}

impl WorkerHandle {
    /// Spawn a new worker process and verify it answers a ping.
    pub fn spawn(worker_path: &Path) -> Result<Self> {
        let child = Command::new(worker_path)
            .env(WORKER_ENV_MARKER, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;
        SPAWNED_WORKERS.fetch_add(1, Ordering::SeqCst);

        let mut handle = Self::from_child(child)?;
        handle.send_command(&WorkerCommand::Ping)?;
        match handle.recv_response()? {
            WorkerResponse::Pong => {
                tracing::debug!("Worker {} is ready", handle.pid());
                Ok(handle)
            }
            other => Err(Error::Ipc(format!(
                "Unexpected response from worker: {:?}",
                other
            ))),
        }
    }

    /// Take ownership of a child spawned with piped stdin and stdout.
    pub(crate) fn from_child(mut child: Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        Ok(Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            killed: false,
            completed_units: 0,
        })
    }

    /// Send a command to the worker.
    pub fn send_command(&mut self, cmd: &WorkerCommand) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, cmd)
    }

    /// Receive a response from the worker.
    pub fn recv_response(&mut self) -> Result<WorkerResponse> {
        if self.killed {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        read_message(&mut self.stdout)
    }

    /// Send a chunk of units. One response per unit follows.
    pub fn start_chunk(
        &mut self,
        task: &str,
        kwargs_json: &[u8],
        units: Vec<UnitPayload>,
    ) -> Result<()> {
        self.send_command(&WorkerCommand::Execute {
            task: task.to_string(),
            kwargs_json: kwargs_json.to_vec(),
            units,
        })
    }

    /// Record completed units and report the running total.
    pub fn record_completed(&mut self, units: usize) -> usize {
        self.completed_units += units;
        self.completed_units
    }

    /// Kill the worker process immediately and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        self.killed = true;

        if let Err(e) = self.child.kill() {
            // InvalidInput means the process already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }

        // Wait to reap zombie
        let _ = self.child.wait();

        Ok(())
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Graceful shutdown - ask worker to exit cleanly and reap it.
    pub fn shutdown(mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        if self.send_command(&WorkerCommand::Shutdown).is_ok() {
            // Best effort: a worker that already died cannot acknowledge.
            let _ = self.recv_response();
        }

        let waited = self.child.wait();
        // Reaped; Drop must not try again.
        self.killed = true;

        match waited {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(Error::Ipc(format!("Worker exited with status: {}", status))),
            Err(e) => Err(Error::Ipc(format!("Failed to wait for worker: {}", e))),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Ensure worker is killed when handle is dropped
        let _ = self.kill();
    }
}

/// Thread-safe handle for killing a worker from another thread.
#[derive(Clone)]
pub struct WorkerKillHandle {
    /// Process ID of the worker.
    pid: u32,
    /// Whether the kill has been requested.
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    /// Create a kill handle for a worker.
    pub fn new(worker: &WorkerHandle) -> Self {
        Self {
            pid: worker.pid(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kill the worker process.
    ///
    /// The owning `WorkerHandle` still reaps the process.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return; // Already killed
        }

        #[cfg(unix)]
        {
            // SIGKILL for immediate termination
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        {
            tracing::warn!(
                "Immediate kill of worker {} is only supported on unix; it will be reaped on close",
                self.pid
            );
        }
    }
}
