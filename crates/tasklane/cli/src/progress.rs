//! Terminal progress bars for engine batches.

use indicatif::{ProgressBar, ProgressStyle};
use tasklane::{ProgressHandle, ProgressReporter};

const TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

/// Draws one bar per batch or stream on stderr.
///
/// indicatif hides the bar when stderr is not a terminal.
pub struct BarProgress;

impl ProgressReporter for BarProgress {
    fn begin(&self, total: usize, label: &str) -> Box<dyn ProgressHandle> {
        let bar = ProgressBar::new(total as u64);
        if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar.set_message(label.to_string());
        Box::new(BarHandle { bar })
    }
}

struct BarHandle {
    bar: ProgressBar,
}

impl ProgressHandle for BarHandle {
    fn mark(&mut self, position: usize) {
        self.bar.set_position(position as u64);
    }

    fn finish(&mut self) {
        self.bar.finish_and_clear();
    }
}
