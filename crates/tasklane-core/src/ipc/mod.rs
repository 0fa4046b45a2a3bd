//! Inter-process communication for tasklane worker processes.
//!
//! This module provides the protocol and utilities for communicating
//! with the worker processes that execute task units.

pub mod protocol;
mod worker;

pub use protocol::{UnitPayload, WorkerCommand, WorkerResponse, read_message, write_message};
pub use worker::{
    WORKER_ENV_MARKER, WorkerHandle, WorkerKillHandle, find_worker_binary, in_worker_process,
    spawned_worker_count,
};
