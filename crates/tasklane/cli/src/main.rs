//! tasklane CLI - run built-in tasks on a pool of worker processes.

mod progress;
mod run;

use clap::builder::RangedU64ValueParser;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "tasklane")]
#[command(about = "Run tasks in parallel on a pool of worker processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a built-in task over the inputs 0..count
    Run {
        /// Name of the task
        task: String,

        /// Number of inputs
        #[arg(short, long, default_value = "10")]
        count: u64,

        /// Number of worker processes (1 runs everything in-process)
        #[arg(
            short = 'j',
            long,
            value_parser = RangedU64ValueParser::<usize>::new().range(1..)
        )]
        num_procs: Option<usize>,

        /// Run in the current process
        #[arg(long)]
        force_serial: bool,

        /// Units per dispatch (omit for one unit per dispatch)
        #[arg(long)]
        chunksize: Option<usize>,

        /// Print results as they complete instead of in input order
        #[arg(long)]
        unordered: bool,

        /// Report parallel failures instead of re-running serially
        #[arg(long)]
        no_serial_fallback: bool,

        /// Log how long the stream took
        #[arg(long)]
        time_generate: bool,

        /// Collect every result before printing
        #[arg(long)]
        batch: bool,

        /// Input at which `fail_on` fails
        #[arg(long, default_value = "3")]
        fail_on: i64,

        /// `factor` keyword for `scale`
        #[arg(long)]
        factor: Option<f64>,
    },

    /// List the built-in tasks
    Tasks,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            task,
            count,
            num_procs,
            force_serial,
            chunksize,
            unordered,
            no_serial_fallback,
            time_generate,
            batch,
            fail_on,
            factor,
        } => run::execute(run::RunArgs {
            task,
            count,
            num_procs,
            force_serial,
            chunksize,
            unordered,
            no_serial_fallback,
            time_generate,
            batch,
            fail_on,
            factor,
        }),
        Commands::Tasks => run::list_tasks(),
    }
}
