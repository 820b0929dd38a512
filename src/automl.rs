//! Run driver: plans the work, runs it group by group and reports.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::AutoMlConfig;
use crate::countdown::Countdown;
use crate::error::{AutoMlError, Result};
use crate::events::{Event, EventLog, Stage};
use crate::executor::{ResultStatus, StepResultState, StepsExecutor, Submission};
use crate::leaderboard::{LeaderboardRow, Leaderboards, SortMetric};
use crate::progress::ProgressSink;
use crate::registry::{
    Constraint, ResolvedStep, StepCatalog, StepRequest, StepsRegistry, default_plan,
    definition_plan, reproducible_plan,
};
use crate::steps::{RunContext, Step};
use crate::trainer::Trainer;
use crate::work::{Algo, Work, WorkLedger};

/// Time limit applied when neither a time nor a model budget is configured.
const DEFAULT_MAX_RUNTIME_SECS: f64 = 3600.0;

/// A resolved plan with its frozen ledger.
#[derive(Debug)]
pub struct Plan {
    pub steps: Vec<ResolvedStep>,
    pub ledger: Arc<WorkLedger>,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub duration_ms: u128,
    pub sort_metric: SortMetric,
    pub leader: Option<String>,
    pub leaderboard: Vec<LeaderboardRow>,
    pub steps: Vec<StepResultState>,
    pub evictions: Vec<String>,
    pub model_count: usize,
    pub progress: f64,
    /// Explicit requests replaying the steps that succeeded.
    pub actual_plan: Vec<StepRequest>,
    pub events: Vec<Event>,
}

pub struct AutoML {
    config: AutoMlConfig,
    catalog: StepCatalog,
    trainer: Arc<dyn Trainer>,
    events: Arc<EventLog>,
    run_id: String,
}

impl AutoML {
    /// Validates `config` and registers its extra providers.
    pub fn new(config: AutoMlConfig, trainer: Arc<dyn Trainer>) -> Result<Self> {
        if config.exclude_algos.is_some() && config.include_algos.is_some() {
            return Err(AutoMlError::InvalidArgument(
                "Parameters `exclude_algos` and `include_algos` are mutually exclusive: \
                 please use only one of them if necessary."
                    .into(),
            ));
        }
        if config.exploitation_ratio >= 1.0 {
            return Err(AutoMlError::InvalidArgument(
                "`exploitation_ratio` must be lower than 1.".into(),
            ));
        }
        if config.max_consecutive_model_failures == 0 {
            return Err(AutoMlError::InvalidArgument(
                "`max_consecutive_model_failures` must be at least 1.".into(),
            ));
        }
        let catalog = StepCatalog::builtin().with_providers(config.providers.clone())?;
        let run_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        Ok(Self {
            config,
            catalog,
            trainer,
            events: Arc::new(EventLog::new()),
            run_id,
        })
    }

    pub fn config(&self) -> &AutoMlConfig {
        &self.config
    }

    pub fn catalog(&self) -> &StepCatalog {
        &self.catalog
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The configured plan, or the builtin one. Seeded runs leave out steps
    /// whose outcome depends on timing.
    pub fn modeling_plan(&self) -> Vec<StepRequest> {
        match (&self.config.modeling_plan, self.config.seed) {
            (Some(plan), _) => plan.clone(),
            (None, Some(_)) => reproducible_plan(),
            (None, None) => default_plan(),
        }
    }

    /// Algorithms the configuration turns off.
    fn skipped_algos(&self) -> Vec<Algo> {
        if let Some(excluded) = &self.config.exclude_algos {
            return excluded.clone();
        }
        match &self.config.include_algos {
            Some(included) => Algo::ALL
                .into_iter()
                .filter(|a| *a != Algo::Virtual && !included.contains(a))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Resolves the modeling plan and allocates its work.
    pub fn plan(&self) -> Result<Plan> {
        let requests = self.modeling_plan();
        let steps = StepsRegistry::new(&self.catalog, &self.events).resolve(&requests)?;

        let ledger = Arc::new(WorkLedger::new());
        for step in &steps {
            ledger.allocate(step.to_work())?;
        }
        for algo in self.skipped_algos() {
            self.events.info(
                Stage::Workflow,
                format!("Disabling Algo: {algo} as requested by the user."),
            );
            for provider in self.catalog.providers().iter().filter(|p| p.algo == algo) {
                ledger.remove(&provider.name)?;
            }
        }
        self.events
            .debug(Stage::Workflow, format!("Defined work allocations: {ledger}"));
        self.distribute_exploitation(&ledger)?;
        self.events
            .debug(Stage::Workflow, format!("Actual work allocations: {ledger}"));
        ledger.freeze();

        let steps = steps
            .into_iter()
            .filter(|s| ledger.get(&s.id, &s.provider).is_some())
            .collect();
        Ok(Plan { steps, ledger })
    }

    /// Resizes exploitation work so it makes up `exploitation_ratio` of the
    /// total. Exploration weights are left untouched.
    fn distribute_exploitation(&self, ledger: &WorkLedger) -> Result<()> {
        let ratio = self.config.exploitation_ratio;
        if ratio < 0.0 {
            return Ok(());
        }
        let exploration = |w: &Work| w.job_type.is_exploration();
        let exploitation = |w: &Work| w.job_type.is_exploitation();
        let sum_exploration = ledger.remaining_work(Some(&exploration)) as f64;
        let sum_exploitation = ledger.remaining_work(Some(&exploitation)) as f64;
        if sum_exploitation == 0.0 {
            return Ok(());
        }
        let new_total = (sum_exploration / (1.0 - ratio)).round();
        let factor = (new_total - sum_exploration).max(0.0) / sum_exploitation;
        ledger.rescale(exploitation, factor)
    }

    fn countdown(&self) -> Countdown {
        let secs = self.config.max_runtime_secs;
        if self.config.max_models == 0 && secs <= 0.0 {
            self.events.info(
                Stage::Workflow,
                "No runtime constraint set (max runtime or max models), using default 1h time limit",
            );
            return Countdown::from_secs(DEFAULT_MAX_RUNTIME_SECS);
        }
        Countdown::from_secs(secs)
    }

    /// Plans and runs every step, reporting progress to `parent`.
    ///
    /// Returns [`AutoMlError::TooManyFailures`] once too many steps in a row
    /// failed; steps ignoring the failure count never add to that tally.
    pub async fn run(&self, parent: Arc<dyn ProgressSink>) -> Result<RunReport> {
        let plan = self.plan()?;
        let sort = self.config.effective_sort_metric();
        let boards = Leaderboards::new(self.config.polarity_table()).with_events(Arc::clone(&self.events));
        let leaderboard = boards.get_or_make(&format!("AutoML_{}", self.run_id), Some(sort.name.as_str()));

        let ctx = RunContext::new(Arc::clone(&plan.ledger), leaderboard, Arc::clone(&self.trainer))
            .with_events(Arc::clone(&self.events))
            .with_countdown(Arc::new(self.countdown()))
            .with_max_models(self.config.max_models)
            .with_resolution(self.config.resolution)
            .with_seed(self.config.seed.unwrap_or_default());
        let ctx = Arc::new(ctx);
        let executor = StepsExecutor::new(Arc::clone(&ctx), self.config.parallelism);
        let steps: Vec<Arc<Step>> = plan
            .steps
            .iter()
            .cloned()
            .map(|s| Arc::new(Step::from_resolved(s)))
            .collect();

        executor.start();
        self.events.info(
            Stage::Workflow,
            format!("AutoML build started: {}", Utc::now().format("%Y.%m.%d %H:%M:%S%.3f")),
        );
        let outcome = self.drive(&executor, &steps, &parent).await;
        executor.stop();

        let built = executor.model_count();
        self.events.info(
            Stage::Workflow,
            format!("AutoML build done: built {built} models"),
        );
        let (states, completed) = outcome?;
        if ctx.leaderboard.is_empty() {
            self.events.warn(
                Stage::Workflow,
                format!(
                    "Empty leaderboard. AutoML was not able to build any model within a max runtime \
                     constraint of {} seconds, you may want to increase this value before retrying.",
                    self.config.max_runtime_secs
                ),
            );
        }
        let actual_plan = definition_plan(completed.iter().map(|s| s.definition()));
        self.events.info(
            Stage::Workflow,
            format!("Actual modeling steps: {}", serde_json::to_string(&actual_plan)?),
        );
        info!(run_id = %self.run_id, models = built, "run finished");

        Ok(RunReport {
            run_id: self.run_id.clone(),
            started_at: ctx.countdown.start_time(),
            stopped_at: ctx.countdown.stop_time(),
            duration_ms: ctx.countdown.elapsed().as_millis(),
            sort_metric: sort,
            leader: ctx.leaderboard.leader().map(|c| c.id),
            leaderboard: ctx.leaderboard.rows(),
            steps: states,
            evictions: executor.evictions(),
            model_count: built,
            progress: executor.progress_credited(),
            actual_plan,
            events: self.events.events(),
        })
    }

    /// Submits groups in order, waiting for each before the next.
    async fn drive(
        &self,
        executor: &StepsExecutor,
        steps: &[Arc<Step>],
        parent: &Arc<dyn ProgressSink>,
    ) -> Result<(Vec<StepResultState>, Vec<Arc<Step>>)> {
        let by_id: HashMap<String, &Arc<Step>> = steps.iter().map(|s| (s.global_id(), s)).collect();
        let mut states = Vec::with_capacity(steps.len());
        let mut completed = Vec::new();
        let mut failures = 0;

        for group in steps.chunk_by(|a, b| a.definition().priority_group == b.definition().priority_group) {
            for step in group {
                if let Some(reason) = executor.limit_reached(step, parent.as_ref()) {
                    states.push(executor.skip(step, parent.as_ref(), reason));
                    continue;
                }
                if let Submission::NotStarted(state) = executor.submit(Arc::clone(step), Arc::clone(parent)).await {
                    states.push(state);
                }
            }
            for state in executor.wait_all().await {
                info!(step = %state.id, status = %state.status, "step returned");
                match state.status {
                    ResultStatus::Success => {
                        failures = 0;
                        if let Some(step) = by_id.get(&state.id) {
                            completed.push(Arc::clone(step));
                        }
                    }
                    ResultStatus::Failed => {
                        let counts = by_id
                            .get(&state.id)
                            .is_none_or(|s| !s.ignores(Constraint::FailureCount));
                        if counts {
                            failures += 1;
                            if failures >= self.config.max_consecutive_model_failures {
                                self.events.error(
                                    Stage::ModelTraining,
                                    format!("Aborting AutoML after too many consecutive model failures: {state}"),
                                );
                                return Err(AutoMlError::TooManyFailures {
                                    count: failures,
                                    last: state.id,
                                });
                            }
                        }
                    }
                    ResultStatus::Skipped | ResultStatus::Cancelled => {}
                }
                states.push(state);
            }
        }
        Ok((states, completed))
    }
}
