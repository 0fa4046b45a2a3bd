//! Worker-side command loop.
//!
//! A worker binary builds the same [`TaskRegistry`] as its parent and calls
//! [`serve_worker`]. Commands arrive on stdin, responses leave on stdout;
//! stdout carries nothing but IPC frames, so logging must go to stderr.

use std::io::{BufReader, BufWriter, Read, Write};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::ipc::{UnitPayload, WorkerCommand, WorkerResponse, read_message, write_message};
use crate::task::{Kwargs, TaskRegistry};

/// Serve commands on stdin/stdout until `Shutdown`.
///
/// SIGINT is ignored so that Ctrl-C in a terminal reaches only the parent,
/// which then tears the pool down.
pub fn serve_worker(registry: &TaskRegistry) -> Result<()> {
    // SAFETY: installing SIG_IGN has no preconditions.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
    }

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());
    tracing::debug!("Worker {} ready", std::process::id());
    serve(registry, &mut reader, &mut writer)
}

/// Command loop over arbitrary streams.
pub fn serve<R: Read, W: Write>(
    registry: &TaskRegistry,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    loop {
        let command: WorkerCommand = read_message(reader)?;
        match command {
            WorkerCommand::Ping => write_message(writer, &WorkerResponse::Pong)?,
            WorkerCommand::Execute {
                task,
                kwargs_json,
                units,
            } => run_chunk(registry, &task, &kwargs_json, units, writer)?,
            WorkerCommand::Shutdown => {
                write_message(writer, &WorkerResponse::ShuttingDown)?;
                tracing::debug!("Worker {} shutting down", std::process::id());
                return Ok(());
            }
        }
    }
}

fn run_chunk<W: Write>(
    registry: &TaskRegistry,
    task: &str,
    kwargs_json: &[u8],
    units: Vec<UnitPayload>,
    writer: &mut W,
) -> Result<()> {
    let kwargs: std::result::Result<Kwargs, String> = serde_json::from_slice(kwargs_json)
        .map_err(|e| format!("invalid keyword arguments: {}", e));

    for unit in units {
        let index = unit.index;
        let outcome = match &kwargs {
            Ok(kwargs) => serde_json::from_slice::<Value>(&unit.args_json)
                .map_err(|e| Error::InvalidArguments(format!("undecodable arguments: {}", e)))
                .and_then(|args| registry.call_raw(task, args, kwargs, index)),
            Err(message) => Err(Error::InvalidArguments(message.clone())),
        };
        write_message(writer, &response_for(index, outcome))?;
    }
    Ok(())
}

fn response_for(index: usize, outcome: Result<Value>) -> WorkerResponse {
    match outcome {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(value_json) => WorkerResponse::Output { index, value_json },
            Err(e) => WorkerResponse::Error {
                index,
                message: format!("unencodable result: {}", e),
            },
        },
        Err(Error::Task { message, .. }) => WorkerResponse::Error { index, message },
        Err(Error::TaskPanicked { message, .. }) => WorkerResponse::Panic { index, message },
        Err(other) => WorkerResponse::Error {
            index,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry
            .register("square", |(x,): (i64,)| x * x)
            .register("explode", |(_,): (i64,)| -> i64 { panic!("kaboom") })
            .register_fallible("checked", |(x,): (i64,)| {
                if x < 0 { Err("negative") } else { Ok(x) }
            });
        registry
    }

    fn frames(commands: &[WorkerCommand]) -> Cursor<Vec<u8>> {
        let mut input = Vec::new();
        for command in commands {
            write_message(&mut input, command).unwrap();
        }
        Cursor::new(input)
    }

    fn responses(output: Vec<u8>) -> Vec<WorkerResponse> {
        let mut cursor = Cursor::new(output);
        let mut responses = Vec::new();
        while (cursor.position() as usize) < cursor.get_ref().len() {
            responses.push(read_message(&mut cursor).unwrap());
        }
        responses
    }

    fn execute(task: &str, args: &[&str]) -> WorkerCommand {
        WorkerCommand::Execute {
            task: task.to_string(),
            kwargs_json: b"{}".to_vec(),
            units: args
                .iter()
                .enumerate()
                .map(|(index, args)| UnitPayload {
                    index: index + 10,
                    args_json: args.as_bytes().to_vec(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_ping_execute_shutdown() {
        let mut input = frames(&[
            WorkerCommand::Ping,
            execute("square", &["[3]", "[4]"]),
            WorkerCommand::Shutdown,
        ]);
        let mut output = Vec::new();
        serve(&registry(), &mut input, &mut output).unwrap();

        let responses = responses(output);
        assert_eq!(responses.len(), 4);
        assert!(matches!(responses[0], WorkerResponse::Pong));
        match &responses[1] {
            WorkerResponse::Output { index, value_json } => {
                assert_eq!(*index, 10);
                assert_eq!(value_json.as_slice(), b"9");
            }
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(responses[2].unit_index(), Some(11));
        assert!(matches!(responses[3], WorkerResponse::ShuttingDown));
    }

    #[test]
    fn test_failures_become_responses() {
        let mut input = frames(&[
            execute("checked", &["[-1]"]),
            execute("explode", &["[0]"]),
            execute("missing", &["[0]"]),
            execute("square", &["not json"]),
            WorkerCommand::Shutdown,
        ]);
        let mut output = Vec::new();
        serve(&registry(), &mut input, &mut output).unwrap();

        let responses = responses(output);
        assert!(matches!(
            &responses[0],
            WorkerResponse::Error { message, .. } if message == "negative"
        ));
        assert!(matches!(
            &responses[1],
            WorkerResponse::Panic { message, .. } if message == "kaboom"
        ));
        assert!(matches!(
            &responses[2],
            WorkerResponse::Error { message, .. } if message.contains("missing")
        ));
        assert!(matches!(&responses[3], WorkerResponse::Error { index: 10, .. }));
    }

    #[test]
    fn test_eof_is_an_error() {
        let mut input = frames(&[WorkerCommand::Ping]);
        let mut output = Vec::new();
        assert!(serve(&registry(), &mut input, &mut output).is_err());
    }
}
