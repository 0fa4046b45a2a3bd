//! Serial fallback for streams whose parallel path failed.

use crate::config::EngineConfig;
use crate::task::TaskUnit;

use super::UnitSource;

/// What a stream does when its parallel path fails.
///
/// Applied at most once per stream and always to the whole remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Re-run every unyielded unit in-process.
    Serial,
    /// Yield the error and end the stream.
    Propagate,
}

impl FallbackPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        if config.serial_fallback {
            FallbackPolicy::Serial
        } else {
            FallbackPolicy::Propagate
        }
    }
}

/// Unyielded in-flight units (index order) followed by the rest of the source.
pub(crate) fn remainder<'a>(unyielded: Vec<TaskUnit>, rest: UnitSource<'a>) -> UnitSource<'a> {
    Box::new(unyielded.into_iter().map(Ok).chain(rest))
}
