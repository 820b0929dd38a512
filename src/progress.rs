//! Progress reporting towards the job that owns a run.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Receives progress deltas. Fractions are relative to the whole run.
pub trait ProgressSink: Send + Sync {
    fn advance(&self, fraction: f64);

    /// Optional status line accompanying progress.
    fn message(&self, _msg: &str) {}

    /// Whether the owner asked the run to stop starting new steps.
    fn stop_requested(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct JobProgress {
    progress: f64,
    message: String,
}

/// The parent job of a run: accumulates progress and carries the stop flag.
#[derive(Debug, Default)]
pub struct ParentJob {
    name: String,
    state: Mutex<JobProgress>,
    stop_requested: AtomicBool,
}

impl ParentJob {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn progress(&self) -> f64 {
        self.state.lock().progress
    }

    pub fn last_message(&self) -> String {
        self.state.lock().message.clone()
    }

    /// Asks the run to stop starting new steps.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }
}

impl ProgressSink for ParentJob {
    fn advance(&self, fraction: f64) {
        self.state.lock().progress += fraction;
    }

    fn message(&self, msg: &str) {
        self.state.lock().message = msg.to_string();
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}
