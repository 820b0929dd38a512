use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a step: PENDING → STARTED → {COMPLETED | SKIPPED}, or
/// PENDING → SKIPPED directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    Pending,
    Started,
    Completed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Completed | StepState::Skipped)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepState::Pending => write!(f, "PENDING"),
            StepState::Started => write!(f, "STARTED"),
            StepState::Completed => write!(f, "COMPLETED"),
            StepState::Skipped => write!(f, "SKIPPED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Start,
    Skip,
    Complete,
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Next(StepState),
    /// The event is not valid in the current state; nothing changed.
    Rejected { from: StepState, event: StepEvent },
}

/// A step's current state plus the states it went through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lifecycle {
    pub state: StepState,
    pub history: Vec<StepState>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: StepState::Pending,
            history: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Drives a [`Lifecycle`] through the step state machine.
pub struct StateMachine;

impl StateMachine {
    pub fn next(lifecycle: &mut Lifecycle, event: StepEvent) -> Transition {
        let next = match (lifecycle.state, event) {
            (StepState::Pending, StepEvent::Start) => StepState::Started,
            (StepState::Pending, StepEvent::Skip) => StepState::Skipped,
            (StepState::Started, StepEvent::Complete) => StepState::Completed,
            (from, event) => {
                tracing::warn!(%from, ?event, "rejected step transition");
                return Transition::Rejected { from, event };
            }
        };

        let now = Utc::now();
        lifecycle.history.push(lifecycle.state);
        lifecycle.state = next;
        if next == StepState::Started {
            lifecycle.started_at = Some(now);
        }
        if next.is_terminal() {
            lifecycle.finished_at = Some(now);
        }
        Transition::Next(next)
    }
}
