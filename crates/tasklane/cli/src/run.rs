//! Run command implementation for tasklane CLI.
//!
//! Runs a built-in task over `0..count` and prints one JSON result per line.

use std::io::{self, Write};
use std::time::Instant;

use serde_json::{Value, json};
use tasklane::builtin;
use tasklane::{Engine, EngineConfig, GenerateOptions, Kwargs, ProcessOptions};

use crate::progress::BarProgress;

/// Options of `tasklane run`.
pub struct RunArgs {
    pub task: String,
    pub count: u64,
    pub num_procs: Option<usize>,
    pub force_serial: bool,
    pub chunksize: Option<usize>,
    pub unordered: bool,
    pub no_serial_fallback: bool,
    pub time_generate: bool,
    pub batch: bool,
    pub fail_on: i64,
    pub factor: Option<f64>,
}

/// Execute a run.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let registry = builtin::registry();
    if !registry.contains(&args.task) {
        anyhow::bail!(
            "Unknown task: {} (available: {})",
            args.task,
            registry.names().join(", ")
        );
    }
    if builtin::sample_args(&args.task, 0, args.fail_on).is_none() {
        anyhow::bail!("Task '{}' cannot be run from the command line", args.task);
    }

    let mut config = EngineConfig::from_env()?;
    if let Some(num_procs) = args.num_procs {
        config = config.with_num_procs(num_procs);
    }
    if args.force_serial {
        config = config.with_force_serial(true);
    }
    if args.no_serial_fallback {
        config = config.with_serial_fallback(false);
    }
    if args.time_generate {
        config = config.with_time_generate(true);
    }

    let mut kwargs = Kwargs::new();
    if let Some(factor) = args.factor {
        kwargs.insert("factor".to_string(), json!(factor));
    }

    let inputs: Vec<Value> = (0..args.count)
        .filter_map(|i| builtin::sample_args(&args.task, i, args.fail_on))
        .collect();

    let engine = Engine::new(registry, config).with_progress(BarProgress);
    let start = Instant::now();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut produced = 0usize;

    let outcome = if args.batch {
        let options = ProcessOptions::default().kwargs(kwargs);
        engine
            .process::<_, _, Value>(&args.task, inputs, options)
            .map_err(anyhow::Error::from)
            .and_then(|results| {
                for result in results {
                    writeln!(out, "{}", result)?;
                    produced += 1;
                }
                Ok(())
            })
    } else {
        let mut options = GenerateOptions::default().kwargs(kwargs).ordered(!args.unordered);
        if let Some(chunksize) = args.chunksize {
            options = options.chunksize(chunksize);
        }
        stream_results(&engine, &args.task, inputs, options, &mut out, &mut produced)
    };
    engine.close_pool(false);
    outcome?;

    tracing::info!(
        "Completed {} '{}' tasks in {:.2}s",
        produced,
        args.task,
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

fn stream_results(
    engine: &Engine,
    task: &str,
    inputs: Vec<Value>,
    options: GenerateOptions,
    out: &mut impl Write,
    produced: &mut usize,
) -> anyhow::Result<()> {
    for result in engine.generate::<_, _, Value>(task, inputs, options)? {
        writeln!(out, "{}", result?)?;
        *produced += 1;
    }
    Ok(())
}

/// List the built-in tasks.
pub fn list_tasks() -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for name in builtin::registry().names() {
        writeln!(out, "{}", name)?;
    }
    Ok(())
}
