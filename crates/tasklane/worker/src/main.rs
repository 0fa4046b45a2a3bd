//! tasklane worker process.
//!
//! Spawned by the pool; serves commands on stdin/stdout against the built-in
//! task registry. Logs go to stderr because stdout carries IPC frames.

fn main() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if !tasklane::in_worker_process() {
        anyhow::bail!(
            "tasklane-worker is started by the tasklane pool and is not meant to be run directly"
        );
    }

    tasklane::serve_worker(&tasklane::builtin::registry())?;
    Ok(())
}
