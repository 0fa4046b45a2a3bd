//! Engine configuration.
//!
//! Tunables are read once, either from the environment or from a caller
//! (typically a CLI) that builds an [`EngineConfig`] directly.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Environment variable overriding the default worker count.
pub const ENV_NUM_PROCS: &str = "TASKLANE_NUM_PROCS";
/// Environment variable forcing serial execution.
pub const ENV_FORCE_SERIAL: &str = "TASKLANE_FORCE_SERIAL";
/// Environment variable disabling the serial fallback of streams.
pub const ENV_NO_SERIAL_FALLBACK: &str = "TASKLANE_NO_SERIAL_FALLBACK";
/// Environment variable enabling timing of `generate` streams.
pub const ENV_TIME_GENERATE: &str = "TASKLANE_TIME_GENERATE";
/// Environment variable setting the per-worker recycle threshold.
pub const ENV_MAX_TASKS_PER_WORKER: &str = "TASKLANE_MAX_TASKS_PER_WORKER";
/// Environment variable pointing at the worker binary.
pub const ENV_WORKER_PATH: &str = "TASKLANE_WORKER_PATH";

/// Process-wide engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker count override. `None` uses CPU cores minus one.
    pub num_procs: Option<usize>,
    /// Run every executor call serially unless the call says otherwise.
    pub force_serial: bool,
    /// Rerun the remainder of a failed parallel stream serially.
    pub serial_fallback: bool,
    /// Log the wall time of every `generate` stream.
    pub time_generate: bool,
    /// Recycle a worker process after this many completed units.
    pub max_tasks_per_worker: Option<usize>,
    /// Explicit path to the worker binary.
    pub worker_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_procs: None,
            force_serial: false,
            serial_fallback: true,
            time_generate: false,
            max_tasks_per_worker: None,
            worker_path: None,
        }
    }
}

impl EngineConfig {
    /// Build a configuration from `TASKLANE_*` environment variables.
    ///
    /// Unset variables keep their defaults. Malformed values are reported as
    /// [`Error::Config`] rather than silently ignored.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_NUM_PROCS) {
            config.num_procs = Some(parse_count(ENV_NUM_PROCS, &value)?);
        }
        if let Some(value) = lookup(ENV_FORCE_SERIAL) {
            config.force_serial = parse_flag(ENV_FORCE_SERIAL, &value)?;
        }
        if let Some(value) = lookup(ENV_NO_SERIAL_FALLBACK) {
            config.serial_fallback = !parse_flag(ENV_NO_SERIAL_FALLBACK, &value)?;
        }
        if let Some(value) = lookup(ENV_TIME_GENERATE) {
            config.time_generate = parse_flag(ENV_TIME_GENERATE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_TASKS_PER_WORKER) {
            config.max_tasks_per_worker = Some(parse_count(ENV_MAX_TASKS_PER_WORKER, &value)?);
        }
        if let Some(value) = lookup(ENV_WORKER_PATH) {
            if !value.is_empty() {
                config.worker_path = Some(PathBuf::from(value));
            }
        }

        Ok(config)
    }

    /// Set the worker count override.
    pub fn with_num_procs(mut self, num_procs: usize) -> Self {
        self.num_procs = Some(num_procs);
        self
    }

    /// Set the force-serial flag.
    pub fn with_force_serial(mut self, force_serial: bool) -> Self {
        self.force_serial = force_serial;
        self
    }

    /// Enable or disable the serial fallback.
    pub fn with_serial_fallback(mut self, enabled: bool) -> Self {
        self.serial_fallback = enabled;
        self
    }

    /// Enable or disable stream timing.
    pub fn with_time_generate(mut self, enabled: bool) -> Self {
        self.time_generate = enabled;
        self
    }

    /// Set the per-worker recycle threshold.
    pub fn with_max_tasks_per_worker(mut self, max_tasks: usize) -> Self {
        self.max_tasks_per_worker = Some(max_tasks);
        self
    }

    /// Set the worker binary path.
    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    /// Worker count used when a pool is created without an explicit count.
    pub fn default_num_procs(&self) -> usize {
        self.num_procs
            .unwrap_or_else(|| num_cpus::get().saturating_sub(1).max(1))
    }
}

fn parse_count(key: &str, value: &str) -> Result<usize> {
    let count: usize = value
        .trim()
        .parse()
        .map_err(|_| {
            Error::Config(format!(
                "{} must be a positive integer, got '{}'",
                key, value
            ))
        })?;
    if count == 0 {
        return Err(Error::Config(format!("{} must be at least 1", key)));
    }
    Ok(count)
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean flag, got '{}'",
            key, other
        ))),
    }
}
