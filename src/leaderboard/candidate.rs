use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::work::Algo;

/// A trained model as seen by the scheduler: an opaque id plus its scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub algo: Algo,
    pub metrics: BTreeMap<String, f64>,
    /// Global id (`provider:id`) of the step that produced it.
    #[serde(default)]
    pub source_step: Option<String>,
    /// Priority group of the producing step.
    #[serde(default)]
    pub priority_group: u32,
    /// Ids of the candidates this one aggregates, for meta candidates.
    #[serde(default)]
    pub base_models: Vec<String>,
    #[serde(default)]
    pub training_time_ms: u64,
    /// Trained under monotonicity constraints.
    #[serde(default)]
    pub monotone: bool,
}

impl Candidate {
    pub fn new(id: impl Into<String>, algo: Algo) -> Self {
        Self {
            id: id.into(),
            algo,
            metrics: BTreeMap::new(),
            source_step: None,
            priority_group: 0,
            base_models: Vec::new(),
            training_time_ms: 0,
            monotone: false,
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_lowercase(), value);
        self
    }

    pub fn with_base_models(mut self, base_models: Vec<String>) -> Self {
        self.base_models = base_models;
        self
    }

    pub fn monotone(mut self) -> Self {
        self.monotone = true;
        self
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied().filter(|v| !v.is_nan())
    }

    /// Whether this candidate aggregates other candidates.
    pub fn is_meta(&self) -> bool {
        self.algo == Algo::StackedEnsemble
    }
}
