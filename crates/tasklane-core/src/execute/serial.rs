//! In-process execution.

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::progress::Progress;
use crate::task::{TaskRegistry, TaskUnit};

use super::UnitSource;

/// Run every unit in order, stopping at the first error.
pub(crate) fn run_batch(
    registry: &TaskRegistry,
    units: &[TaskUnit],
    progress: &mut Progress,
) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(units.len());
    for unit in units {
        values.push(registry.call(unit)?);
        progress.advance();
    }
    Ok(values)
}

/// Lazily runs units from a source, one per `next`.
pub(crate) struct SerialRun<'a> {
    registry: Arc<TaskRegistry>,
    units: UnitSource<'a>,
}

impl<'a> SerialRun<'a> {
    pub(crate) fn new(registry: Arc<TaskRegistry>, units: UnitSource<'a>) -> Self {
        Self { registry, units }
    }
}

impl Iterator for SerialRun<'_> {
    type Item = Result<(usize, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        let unit = match self.units.next()? {
            Ok(unit) => unit,
            Err(e) => return Some(Err(e)),
        };
        Some(self.registry.call(&unit).map(|value| (unit.index, value)))
    }
}
