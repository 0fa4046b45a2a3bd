//! IPC protocol messages for tasklane worker processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.
//! Task arguments and results travel as JSON bytes inside the rkyv envelope.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on a single frame.
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Arguments of one unit inside an `Execute` chunk.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct UnitPayload {
    /// Index of the unit in its batch, echoed back in the response.
    pub index: usize,
    /// JSON-encoded positional argument array.
    pub args_json: Vec<u8>,
}

/// Command sent from parent to worker process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerCommand {
    /// Run a chunk of units of the same task, in order.
    ///
    /// The worker answers with one response per unit.
    Execute {
        /// Registered task name.
        task: String,
        /// JSON-encoded keyword object shared by every unit.
        kwargs_json: Vec<u8>,
        /// Units of the chunk.
        units: Vec<UnitPayload>,
    },

    /// Shutdown the worker process gracefully.
    Shutdown,

    /// Ping to check if worker is alive.
    Ping,
}

/// Response sent from worker to parent process.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum WorkerResponse {
    /// A unit completed successfully.
    Output {
        /// Index of the unit.
        index: usize,
        /// JSON-encoded return value.
        value_json: Vec<u8>,
    },

    /// A unit failed with an error.
    Error {
        /// Index of the unit.
        index: usize,
        /// Error message.
        message: String,
    },

    /// The task panicked while running a unit.
    Panic {
        /// Index of the unit.
        index: usize,
        /// Panic message if available.
        message: String,
    },

    /// Response to Ping command.
    Pong,

    /// Acknowledgement of shutdown request.
    ShuttingDown,
}

impl WorkerResponse {
    /// Unit index carried by a per-unit response.
    pub fn unit_index(&self) -> Option<usize> {
        match self {
            WorkerResponse::Output { index, .. }
            | WorkerResponse::Error { index, .. }
            | WorkerResponse::Panic { index, .. } => Some(*index),
            WorkerResponse::Pong | WorkerResponse::ShuttingDown => None,
        }
    }
}

/// Write a message to a writer using length-prefixed rkyv encoding.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(Error::Ipc(format!(
            "IPC message too large to send: {} bytes",
            bytes.len()
        )));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources: our own parent or our own worker processes.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_BYTES {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    let mut bytes = vec![0u8; len];
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: frames only come from the peer process we spawned (or our parent).
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Serialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}
