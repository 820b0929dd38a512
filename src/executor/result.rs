use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Skipped,
    Success,
    Failed,
    Cancelled,
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultStatus::Skipped => write!(f, "skipped"),
            ResultStatus::Success => write!(f, "success"),
            ResultStatus::Failed => write!(f, "failed"),
            ResultStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// How a composite result is derived from its sub-results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Any success wins.
    #[default]
    Optimistic,
    /// Any failure wins.
    Pessimistic,
}

impl Resolution {
    pub fn resolve(&self, statuses: impl IntoIterator<Item = ResultStatus>) -> ResultStatus {
        let (mut success, mut failed, mut cancelled) = (false, false, false);
        for status in statuses {
            match status {
                ResultStatus::Success => success = true,
                ResultStatus::Failed => failed = true,
                ResultStatus::Cancelled => cancelled = true,
                ResultStatus::Skipped => {}
            }
        }
        let order = match self {
            Resolution::Optimistic => [
                (success, ResultStatus::Success),
                (cancelled, ResultStatus::Cancelled),
                (failed, ResultStatus::Failed),
            ],
            Resolution::Pessimistic => [
                (failed, ResultStatus::Failed),
                (cancelled, ResultStatus::Cancelled),
                (success, ResultStatus::Success),
            ],
        };
        order
            .into_iter()
            .find(|(present, _)| *present)
            .map_or(ResultStatus::Skipped, |(_, status)| status)
    }
}

/// Outcome of one step, as reported to the run driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResultState {
    pub id: String,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_states: Vec<StepResultState>,
}

impl StepResultState {
    pub fn new(id: impl Into<String>, status: ResultStatus) -> Self {
        Self {
            id: id.into(),
            status,
            error: None,
            sub_states: Vec::new(),
        }
    }

    pub fn success(id: impl Into<String>) -> Self {
        Self::new(id, ResultStatus::Success)
    }

    /// `reason` is kept in `error` for reporting.
    pub fn skipped(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(id, ResultStatus::Skipped).with_error(reason)
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::new(id, ResultStatus::Failed).with_error(error)
    }

    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::new(id, ResultStatus::Cancelled)
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Builds a composite state whose status is resolved from `sub_states`.
    pub fn composite(
        id: impl Into<String>,
        sub_states: Vec<StepResultState>,
        resolution: Resolution,
    ) -> Self {
        let status = resolution.resolve(sub_states.iter().map(|s| s.status));
        let error = match status {
            ResultStatus::Failed => sub_states
                .iter()
                .find(|s| s.status == ResultStatus::Failed)
                .and_then(|s| s.error.clone()),
            _ => None,
        };
        Self {
            id: id.into(),
            status,
            error,
            sub_states,
        }
    }

    pub fn is(&self, status: ResultStatus) -> bool {
        self.status == status
    }
}

impl fmt::Display for StepResultState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.status)?;
        if let Some(error) = &self.error {
            write!(f, " ({error})")?;
        }
        Ok(())
    }
}
