//! Error types for tasklane-core.

use thiserror::Error;

/// Result type for tasklane-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tasklane-core.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (bad worker count, pool init from a worker, ...).
    #[error("configuration error: {0}")]
    Config(String),

    /// No task is registered under the requested name.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// Task arguments could not be encoded or did not match the task signature.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The task function returned an error.
    #[error("task {index} failed: {message}")]
    Task { index: usize, message: String },

    /// The task function panicked.
    #[error("task {index} panicked: {message}")]
    TaskPanicked { index: usize, message: String },

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// A worker process exited while it owned a task.
    #[error("worker process lost: {0}")]
    WorkerLost(String),

    /// The pool was closed while work was still being submitted.
    #[error("worker pool is closed")]
    PoolClosed,

    /// The argument source produced a different number of items than declared.
    #[error("expected {expected} tasks, argument source produced {actual}")]
    TaskCount { expected: usize, actual: usize },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error comes from the pool machinery rather than from a task.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Error::Ipc(_) | Error::WorkerLost(_) | Error::PoolClosed | Error::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_classification() {
        assert!(Error::PoolClosed.is_infrastructure());
        assert!(Error::WorkerLost("pid 42".into()).is_infrastructure());
        assert!(!Error::Task { index: 0, message: "boom".into() }.is_infrastructure());
        assert!(!Error::Config("bad".into()).is_infrastructure());
    }
}
