use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::countdown::Countdown;
use crate::events::EventLog;
use crate::executor::Resolution;
use crate::leaderboard::{Leaderboard, SortMetric};
use crate::registry::StepKind;
use crate::trainer::Trainer;
use crate::work::{Algo, Work, WorkLedger};

/// What a finished step left behind, for steps planned from run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub kind: StepKind,
    pub algo: Algo,
    pub candidates: Vec<String>,
}

/// Everything a step may read while starting, shared by all steps of a run.
pub struct RunContext {
    pub ledger: Arc<WorkLedger>,
    pub leaderboard: Arc<Leaderboard>,
    pub events: Arc<EventLog>,
    pub countdown: Arc<Countdown>,
    pub trainer: Arc<dyn Trainer>,
    /// Zero means no model budget.
    pub max_models: usize,
    pub resolution: Resolution,
    pub seed: u64,
    model_count: AtomicUsize,
    history: Mutex<Vec<StepRecord>>,
}

impl RunContext {
    pub fn new(
        ledger: Arc<WorkLedger>,
        leaderboard: Arc<Leaderboard>,
        trainer: Arc<dyn Trainer>,
    ) -> Self {
        Self {
            ledger,
            leaderboard,
            events: Arc::new(EventLog::new()),
            countdown: Arc::new(Countdown::new(None)),
            trainer,
            max_models: 0,
            resolution: Resolution::default(),
            seed: 0,
            model_count: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    pub fn with_countdown(mut self, countdown: Arc<Countdown>) -> Self {
        self.countdown = countdown;
        self
    }

    pub fn with_max_models(mut self, max_models: usize) -> Self {
        self.max_models = max_models;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn sort_metric(&self) -> Option<SortMetric> {
        self.leaderboard.sort_metric().cloned()
    }

    /// Non-meta models added to the leaderboard so far.
    pub fn model_count(&self) -> usize {
        self.model_count.load(Ordering::Acquire)
    }

    pub fn add_models(&self, n: usize) {
        self.model_count.fetch_add(n, Ordering::AcqRel);
    }

    /// Counts up to `n` new models against the budget and returns how many
    /// fit. Without a budget every model fits.
    pub fn admit_models(&self, n: usize) -> usize {
        if self.max_models == 0 {
            self.add_models(n);
            return n;
        }
        let mut granted = 0;
        let _ = self
            .model_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                granted = n.min(self.max_models.saturating_sub(count));
                Some(count + granted)
            });
        granted
    }

    /// `None` when there is no model budget.
    pub fn remaining_models(&self) -> Option<usize> {
        (self.max_models > 0).then(|| self.max_models.saturating_sub(self.model_count()))
    }

    /// Share of the remaining time owed to `work`, relative to the remaining
    /// work matching `predicate`. `None` when the run has no time limit.
    pub fn time_share(&self, work: &Work, predicate: Option<&dyn Fn(&Work) -> bool>) -> Option<Duration> {
        let remaining = self.countdown.remaining()?;
        let ratio = self.ledger.remaining_work_ratio(work, predicate);
        Some(remaining.mul_f64(ratio.clamp(0.0, 1.0)))
    }

    pub fn record(&self, record: StepRecord) {
        self.history.lock().push(record);
    }

    pub fn history(&self) -> Vec<StepRecord> {
        self.history.lock().clone()
    }
}
