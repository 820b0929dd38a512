use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::sleep;
use uuid::Uuid;

use super::{TrainFuture, TrainMode, TrainRequest, Trainer};
use crate::error::TrainError;
use crate::leaderboard::{Candidate, Direction, SortMetric};
use crate::work::Algo;

const DEFAULT_SEARCH_SIZE: usize = 5;

/// Deterministic stand-in for a learning backend.
///
/// Produces scores from a hash of the request so that runs with the same
/// seed rank candidates the same way. Nothing is learned.
pub struct SimulatedTrainer {
    metric: SortMetric,
    run_id: String,
    model_delay: Duration,
    search_size: usize,
    unavailable: Vec<Algo>,
    monotone: Vec<Algo>,
    counter: AtomicU64,
}

impl SimulatedTrainer {
    pub fn new(metric: SortMetric) -> Self {
        let run_id = Uuid::new_v4().simple().to_string();
        Self {
            metric,
            run_id: run_id[..8].to_string(),
            model_delay: Duration::from_millis(20),
            search_size: DEFAULT_SEARCH_SIZE,
            unavailable: Vec::new(),
            monotone: Vec::new(),
            counter: AtomicU64::new(1),
        }
    }

    pub fn with_model_delay(mut self, delay: Duration) -> Self {
        self.model_delay = delay;
        self
    }

    /// Models built by a search with no explicit cap.
    pub fn with_search_size(mut self, size: usize) -> Self {
        self.search_size = size.max(1);
        self
    }

    pub fn with_unavailable(mut self, algos: impl IntoIterator<Item = Algo>) -> Self {
        self.unavailable.extend(algos);
        self
    }

    /// Families whose models come out monotonically constrained.
    pub fn with_monotone(mut self, algos: impl IntoIterator<Item = Algo>) -> Self {
        self.monotone.extend(algos);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{prefix}_{n}_AutoML_{}", self.run_id)
    }

    fn score(&self, quality: f64) -> f64 {
        let quality = quality.clamp(0.0, 1.0);
        match self.metric.direction {
            Direction::Descending => quality,
            Direction::Ascending => 1.0 - quality,
        }
    }

    fn quality_of(&self, candidate: &Candidate) -> Option<f64> {
        candidate.metric(&self.metric.name).map(|v| match self.metric.direction {
            Direction::Descending => v,
            Direction::Ascending => 1.0 - v,
        })
    }

    fn plan_models(&self, request: &TrainRequest) -> Vec<(String, Algo, f64, Vec<String>)> {
        let algo = request.algo;
        let noise = |i: u64| unit(mix(request.seed, &request.step, i));
        match &request.mode {
            TrainMode::Single => vec![(
                self.next_id(algo.name()),
                algo,
                base_quality(algo) + 0.05 * noise(0),
                Vec::new(),
            )],
            TrainMode::Search { max_models } | TrainMode::Resume { max_models, .. } => {
                let size = max_models.unwrap_or(self.search_size);
                (0..size as u64)
                    .map(|i| {
                        let id = self.next_id(&format!("{}_grid", algo.name()));
                        (id, algo, base_quality(algo) - 0.02 + 0.08 * noise(i), Vec::new())
                    })
                    .collect()
            }
            TrainMode::Ensemble { base_models } => vec![(
                self.next_id(Algo::StackedEnsemble.name()),
                Algo::StackedEnsemble,
                0.91 + 0.04 * noise(0),
                base_models.clone(),
            )],
            TrainMode::Exploit { base } => {
                let seed = self.quality_of(base).unwrap_or(base_quality(algo));
                vec![(
                    self.next_id(&format!("{}_lr", algo.name())),
                    algo,
                    seed - 0.01 + 0.03 * noise(0),
                    Vec::new(),
                )]
            }
        }
    }
}

impl Trainer for SimulatedTrainer {
    fn is_available(&self, algo: Algo) -> bool {
        !self.unavailable.contains(&algo)
    }

    fn train(&self, request: TrainRequest) -> TrainFuture {
        if !self.is_available(request.algo) {
            let algo = request.algo;
            return Box::pin(async move {
                Err(TrainError::Failed(format!("{algo} is not available")))
            });
        }
        let planned = self.plan_models(&request);
        let scored: Vec<_> = planned
            .into_iter()
            .map(|(id, algo, quality, base)| (id, algo, self.score(quality), base))
            .collect();
        let metric = self.metric.name.clone();
        let delay = self.model_delay;
        let max_runtime = request.max_runtime;
        let monotone = self.monotone.clone();

        Box::pin(async move {
            let started = Instant::now();
            let mut candidates = Vec::with_capacity(scored.len());
            for (id, algo, value, base) in scored {
                if let Some(limit) = max_runtime
                    && !candidates.is_empty()
                    && started.elapsed() + delay > limit
                {
                    break;
                }
                let t0 = Instant::now();
                sleep(delay).await;
                let mut candidate = Candidate::new(id, algo)
                    .with_metric(&metric, value)
                    .with_base_models(base);
                candidate.monotone = monotone.contains(&algo);
                candidate.training_time_ms = t0.elapsed().as_millis() as u64;
                candidates.push(candidate);
            }
            Ok(candidates)
        })
    }
}

fn base_quality(algo: Algo) -> f64 {
    match algo {
        Algo::Glm => 0.78,
        Algo::Drf => 0.84,
        Algo::Gbm => 0.87,
        Algo::XGBoost => 0.88,
        Algo::DeepLearning => 0.82,
        Algo::StackedEnsemble => 0.91,
        Algo::Virtual => 0.5,
    }
}

// splitmix64 over the seed, the step id and an index.
fn mix(seed: u64, step: &str, index: u64) -> u64 {
    let mut h = seed ^ 0x9E37_79B9_7F4A_7C15;
    for b in step.bytes() {
        h = (h ^ u64::from(b)).wrapping_mul(0x100_0000_01B3);
    }
    let mut z = h.wrapping_add(index.wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit(h: u64) -> f64 {
    (h >> 11) as f64 / (1u64 << 53) as f64
}
