//! Fire-and-forget background work.
//!
//! Neither spawner collects results or reports progress, and neither is tied
//! to the pool lifecycle: closing the pool does not stop them.

use std::io::BufWriter;
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::ipc::{UnitPayload, WORKER_ENV_MARKER, WorkerCommand, find_worker_binary, write_message};
use crate::task::encode_args;

/// A thread started by [`spawn_background_thread`].
pub struct BackgroundThread<T> {
    handle: JoinHandle<T>,
}

impl<T> BackgroundThread<T> {
    /// Whether the thread is still running.
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Wait for the thread and return its value.
    pub fn join(self) -> Result<T> {
        self.handle.join().map_err(|payload| Error::TaskPanicked {
            index: 0,
            message: crate::task::panic_message(payload.as_ref()),
        })
    }
}

/// Run `f` on a new named thread.
pub fn spawn_background_thread<F, T>(f: F) -> Result<BackgroundThread<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name("tasklane-background".to_string())
        .spawn(f)?;
    Ok(BackgroundThread { handle })
}

/// A worker process running a single task.
pub struct BackgroundProcess {
    child: Child,
}

impl BackgroundProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the process to exit. Returns whether it exited successfully.
    pub fn wait(&mut self) -> Result<bool> {
        Ok(self.child.wait()?.success())
    }

    /// Kill the process and reap it.
    pub fn kill(&mut self) -> Result<()> {
        if let Err(e) = self.child.kill() {
            if e.kind() != std::io::ErrorKind::InvalidInput {
                return Err(e.into());
            }
        }
        self.child.wait()?;
        Ok(())
    }
}

impl Engine {
    /// Run one task in a separate worker process without waiting for it.
    ///
    /// The process exits on its own once the task is done; its result is
    /// discarded.
    pub fn spawn_background_process(
        &self,
        task: &str,
        args: &impl Serialize,
    ) -> Result<BackgroundProcess> {
        self.registry.require(task)?;
        let args_json = serde_json::to_vec(&encode_args(args)?)
            .map_err(|e| Error::Serialization(format!("Failed to encode arguments: {}", e)))?;
        let worker_path = find_worker_binary(self.config.worker_path.as_deref())?;

        let mut child = Command::new(&worker_path)
            .env(WORKER_ENV_MARKER, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn background process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get background process stdin".to_string()))?;
        let mut stdin = BufWriter::new(stdin);
        let commands = [
            WorkerCommand::Execute {
                task: task.to_string(),
                kwargs_json: b"{}".to_vec(),
                units: vec![UnitPayload { index: 0, args_json }],
            },
            WorkerCommand::Shutdown,
        ];
        for command in &commands {
            if let Err(e) = write_message(&mut stdin, command) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
        // Dropping stdin closes the pipe.
        drop(stdin);

        tracing::debug!("Started background process {} for '{}'", child.id(), task);
        Ok(BackgroundProcess { child })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;
    use crate::config::EngineConfig;
    use crate::task::TaskRegistry;

    #[test]
    fn test_background_thread() {
        let (tx, rx) = mpsc::channel::<()>();
        let thread = spawn_background_thread(move || {
            rx.recv().unwrap();
            42
        })
        .unwrap();

        assert!(thread.is_alive());
        tx.send(()).unwrap();
        assert_eq!(thread.join().unwrap(), 42);
    }

    #[test]
    fn test_background_thread_panic() {
        let thread = spawn_background_thread::<_, ()>(|| panic!("lost")).unwrap();
        while thread.is_alive() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(thread.join(), Err(Error::TaskPanicked { .. })));
    }

    #[test]
    fn test_background_process_requires_binary() {
        let temp = tempfile::TempDir::new().unwrap();
        let mut registry = TaskRegistry::new();
        registry.register("noop", |(x,): (i64,)| x);
        let engine = Engine::new(
            registry,
            EngineConfig::default().with_worker_path(temp.path().join("missing")),
        );

        assert!(matches!(
            engine.spawn_background_process("noop", &(1,)),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            engine.spawn_background_process("other", &(1,)),
            Err(Error::UnknownTask(_))
        ));
    }
}
