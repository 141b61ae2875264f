//! Optional progress reporting for long loops.

use tracing::info;

/// Receives progress of a counted loop. The search never depends on what a
/// reporter does.
pub trait ProgressReporter: Send + Sync {
    fn begin(&self, _label: &str, _total: usize) {}

    fn advance(&self, _label: &str, _done: usize, _total: usize) {}

    fn finish(&self, _label: &str) {}
}

/// Reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {}

/// Logs every `every`-th step and the last one.
#[derive(Debug, Clone, Copy)]
pub struct LogProgress {
    every: usize,
}

impl LogProgress {
    pub fn new(every: usize) -> Self {
        Self { every: every.max(1) }
    }

    fn should_log(&self, done: usize, total: usize) -> bool {
        done == total || done % self.every == 0
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(10)
    }
}

impl ProgressReporter for LogProgress {
    fn begin(&self, label: &str, total: usize) {
        info!("{}: 0/{}", label, total);
    }

    fn advance(&self, label: &str, done: usize, total: usize) {
        if self.should_log(done, total) {
            info!("{}: {}/{}", label, done, total);
        }
    }

    fn finish(&self, label: &str) {
        info!("{}: done", label);
    }
}
