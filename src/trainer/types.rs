use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::leaderboard::Candidate;
use crate::work::Algo;

/// What the backend is asked to build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrainMode {
    /// One model with fixed parameters.
    Single,
    /// A hyperparameter search; `max_models` of `None` means bounded by time only.
    Search { max_models: Option<usize> },
    /// A meta model over existing candidates.
    Ensemble { base_models: Vec<String> },
    /// Retrain variations seeded from an existing candidate.
    Exploit { base: Candidate },
    /// Continue a search started by an earlier step.
    Resume {
        grid: String,
        max_models: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    /// Global id (`provider:id`) of the requesting step.
    pub step: String,
    pub algo: Algo,
    pub priority_group: u32,
    pub mode: TrainMode,
    pub max_runtime: Option<Duration>,
    pub seed: u64,
}

impl TrainRequest {
    pub fn new(step: impl Into<String>, algo: Algo, priority_group: u32, mode: TrainMode) -> Self {
        Self {
            step: step.into(),
            algo,
            priority_group,
            mode,
            max_runtime: None,
            seed: 0,
        }
    }

    pub fn with_max_runtime(mut self, max_runtime: Option<Duration>) -> Self {
        self.max_runtime = max_runtime;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}
