//! User-facing event log of a run.
//!
//! Every entry is also forwarded to `tracing`, so the log doubles as the
//! structured record the host surfaces and as regular diagnostics.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// The phase of the run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Workflow,
    Planning,
    ModelTraining,
    ModelSelection,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Workflow => write!(f, "Workflow"),
            Stage::Planning => write!(f, "Planning"),
            Stage::ModelTraining => write!(f, "ModelTraining"),
            Stage::ModelSelection => write!(f, "ModelSelection"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub stage: Stage,
    pub message: String,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}: {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.level,
            self.stage,
            self.message
        )
    }
}

/// Append-only, thread-safe log of [`Event`]s.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn debug(&self, stage: Stage, message: impl Into<String>) {
        self.record(Level::Debug, stage, message.into());
    }

    pub fn info(&self, stage: Stage, message: impl Into<String>) {
        self.record(Level::Info, stage, message.into());
    }

    pub fn warn(&self, stage: Stage, message: impl Into<String>) {
        self.record(Level::Warn, stage, message.into());
    }

    pub fn error(&self, stage: Stage, message: impl Into<String>) {
        self.record(Level::Error, stage, message.into());
    }

    fn record(&self, level: Level, stage: Stage, message: String) {
        match level {
            Level::Debug => tracing::debug!(stage = %stage, "{message}"),
            Level::Info => tracing::info!(stage = %stage, "{message}"),
            Level::Warn => tracing::warn!(stage = %stage, "{message}"),
            Level::Error => tracing::error!(stage = %stage, "{message}"),
        }
        self.events.lock().push(Event {
            timestamp: Utc::now(),
            level,
            stage,
            message,
        });
    }

    /// Snapshot of all events, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Snapshot of the events at exactly `level`.
    pub fn at_level(&self, level: Level) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level == level)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}
