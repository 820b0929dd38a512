//! Sort direction of leaderboard metrics.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which way a metric ranks candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Lower is better (error-like metrics).
    Ascending,
    /// Higher is better (quality-like metrics).
    Descending,
}

/// Prediction task, used to pick a default sort metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Binomial,
    Multinomial,
    Regression,
}

/// Metric-name to direction lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolarityTable {
    directions: HashMap<String, Direction>,
}

impl Default for PolarityTable {
    fn default() -> Self {
        let mut directions = HashMap::new();
        for name in ["auc", "aucpr"] {
            directions.insert(name.to_string(), Direction::Descending);
        }
        for name in [
            "logloss",
            "mean_per_class_error",
            "rmse",
            "mse",
            "mae",
            "rmsle",
            "mean_residual_deviance",
        ] {
            directions.insert(name.to_string(), Direction::Ascending);
        }
        Self { directions }
    }
}

impl PolarityTable {
    /// Adds or replaces an entry.
    pub fn with(mut self, metric: &str, direction: Direction) -> Self {
        self.directions.insert(metric.to_lowercase(), direction);
        self
    }

    /// Unknown metrics are treated as losses.
    pub fn direction(&self, metric: &str) -> Direction {
        self.directions
            .get(&metric.to_lowercase())
            .copied()
            .unwrap_or(Direction::Ascending)
    }

    pub fn sort_metric(&self, metric: &str) -> SortMetric {
        SortMetric {
            name: metric.to_lowercase(),
            direction: self.direction(metric),
        }
    }
}

/// A metric name together with its resolved direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortMetric {
    pub name: String,
    pub direction: Direction,
}

impl SortMetric {
    pub fn new(name: &str, direction: Direction) -> Self {
        Self {
            name: name.to_lowercase(),
            direction,
        }
    }

    /// Orders two scores best-first. Missing scores rank after present ones.
    pub fn compare(&self, a: Option<f64>, b: Option<f64>) -> Ordering {
        match (a, b) {
            (Some(a), Some(b)) => match self.direction {
                Direction::Ascending => a.total_cmp(&b),
                Direction::Descending => b.total_cmp(&a),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

pub fn default_metric_for(task: Task) -> &'static str {
    match task {
        Task::Binomial => "auc",
        Task::Multinomial => "mean_per_class_error",
        Task::Regression => "mean_residual_deviance",
    }
}
