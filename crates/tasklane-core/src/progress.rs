//! Progress reporting for batches and streams.
//!
//! The engine only talks to the [`ProgressReporter`] trait: `begin` once per
//! batch or stream, `mark` after every completed unit, `finish` exactly once.
//! Rendering is left to the implementation.

/// Factory for per-batch progress handles.
pub trait ProgressReporter: Send + Sync {
    /// Start tracking a batch of `total` units.
    fn begin(&self, total: usize, label: &str) -> Box<dyn ProgressHandle>;
}

/// Progress of a single batch or stream.
pub trait ProgressHandle: Send {
    /// Record that `position` units have completed.
    fn mark(&mut self, position: usize);

    /// Called once when the batch ends, successfully or not.
    fn finish(&mut self);
}

/// Reporter that logs progress through `tracing`, roughly every tenth of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressReporter for LogProgress {
    fn begin(&self, total: usize, label: &str) -> Box<dyn ProgressHandle> {
        tracing::debug!("{}: starting {} tasks", label, total);
        Box::new(LogHandle {
            label: label.to_string(),
            total,
            step: (total / 10).max(1),
            last_logged: 0,
        })
    }
}

struct LogHandle {
    label: String,
    total: usize,
    step: usize,
    last_logged: usize,
}

impl ProgressHandle for LogHandle {
    fn mark(&mut self, position: usize) {
        if position >= self.last_logged + self.step {
            self.last_logged = position;
            tracing::info!("{}: {}/{}", self.label, position, self.total);
        }
    }

    fn finish(&mut self) {
        tracing::debug!("{}: done", self.label);
    }
}

/// Reporter that discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn begin(&self, _total: usize, _label: &str) -> Box<dyn ProgressHandle> {
        Box::new(SilentHandle)
    }
}

struct SilentHandle;

impl ProgressHandle for SilentHandle {
    fn mark(&mut self, _position: usize) {}
    fn finish(&mut self) {}
}

/// Progress of one executor call, guaranteeing a single `finish`.
pub(crate) struct Progress {
    handle: Option<Box<dyn ProgressHandle>>,
    position: usize,
}

impl Progress {
    pub(crate) fn begin(
        reporter: Option<&dyn ProgressReporter>,
        total: usize,
        label: &str,
    ) -> Self {
        let mut handle = reporter.map(|r| r.begin(total, label));
        if let Some(handle) = handle.as_mut() {
            handle.mark(0);
        }
        Self {
            handle,
            position: 0,
        }
    }

    /// Record one more completed unit.
    pub(crate) fn advance(&mut self) {
        self.position += 1;
        if let Some(handle) = self.handle.as_mut() {
            handle.mark(self.position);
        }
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    /// Finish the handle; later calls are no-ops.
    pub(crate) fn finish(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.finish();
        }
    }
}

impl Drop for Progress {
    fn drop(&mut self) {
        self.finish();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingProgress;
    use super::*;

    #[test]
    fn test_progress_finishes_once() {
        let reporter = RecordingProgress::default();
        {
            let mut progress = Progress::begin(Some(&reporter), 3, "square");
            progress.advance();
            progress.advance();
            progress.finish();
            progress.finish();
            assert_eq!(progress.position(), 2);
        }

        let record = reporter.record.lock().unwrap();
        assert_eq!(record.begins, vec![(3, "square".to_string())]);
        assert_eq!(record.marks, vec![0, 1, 2]);
        assert_eq!(record.finishes, 1);
    }

    #[test]
    fn test_drop_finishes() {
        let reporter = RecordingProgress::default();
        drop(Progress::begin(Some(&reporter), 5, "square"));
        assert_eq!(reporter.record.lock().unwrap().finishes, 1);
    }

    #[test]
    fn test_disabled_progress() {
        let mut progress = Progress::begin(None, 5, "square");
        progress.advance();
        progress.finish();
        assert_eq!(progress.position(), 1);
    }

    #[test]
    fn test_log_progress_handles_marks() {
        let mut handle = LogProgress.begin(20, "square");
        for position in 0..=20 {
            handle.mark(position);
        }
        handle.finish();
    }
}
