//! Drives steps against the run budget.
//!
//! The executor owns the one piece of accounting the rest of the crate relies
//! on: every unit of planned work is credited to the parent job exactly once,
//! whether its step trained something, had nothing to do, or was skipped, so
//! a run that drains its ledger always ends at a progress of exactly 1.0.

pub mod result;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use result::{Resolution, ResultStatus, StepResultState};

use crate::events::Stage;
use crate::leaderboard::Candidate;
use crate::progress::ProgressSink;
use crate::registry::Constraint;
use crate::steps::{JobOutput, RunContext, Step, StepEvent, StepRecord};
use crate::work::Work;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Stopped,
    Running,
}

/// What happened to a submitted step.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A job is running; its state is returned by [`StepsExecutor::wait_all`].
    Started,
    NotStarted(StepResultState),
}

impl Submission {
    pub fn is_started(&self) -> bool {
        matches!(self, Submission::Started)
    }
}

#[derive(Debug, Default)]
struct Credit {
    /// Fixed once, when the executor first starts.
    total: Option<u64>,
    consumed: u64,
    credited: f64,
}

struct Shared {
    ctx: Arc<RunContext>,
    credit: Mutex<Credit>,
    evictions: Mutex<Vec<String>>,
}

impl Shared {
    /// Consumes `work` and credits its share to `parent`. The unit that
    /// drains the total brings cumulative progress to exactly 1.0.
    fn credit(&self, work: &Work, parent: &dyn ProgressSink) {
        let mut credit = self.credit.lock();
        let Some(total) = credit.total.filter(|t| *t > 0) else {
            return;
        };
        let weight = u64::from(work.consume());
        if weight == 0 {
            return;
        }
        credit.consumed += weight;
        let delta = if credit.consumed >= total {
            1.0 - credit.credited
        } else {
            (weight as f64 / total as f64).min(1.0 - credit.credited)
        };
        credit.credited += delta;
        parent.advance(delta);
        debug!(
            work = %work.id,
            provider = %work.provider,
            weight,
            progress = credit.credited,
            "credited work"
        );
    }

    fn complete(
        &self,
        step: &Step,
        work: &Work,
        output: JobOutput,
        parent: &dyn ProgressSink,
    ) -> StepResultState {
        let ctx = &self.ctx;
        let def = step.definition();
        let id = def.global_id();

        let (kept, evicted) = match &output.selection {
            Some(selection) => {
                let (admitted, rejected) = self.admit(step, selection.add.clone());
                ctx.leaderboard.insert(admitted.iter().cloned());
                // Old models stay when their replacements did not fit the budget.
                let mut evicted = if rejected.is_empty() {
                    let removed = selection.removed_ids();
                    ctx.leaderboard.remove(&removed);
                    removed
                } else {
                    Vec::new()
                };
                evicted.extend(
                    output
                        .candidates
                        .iter()
                        .filter(|c| !admitted.iter().any(|a| a.id == c.id))
                        .map(|c| c.id.clone()),
                );
                (admitted, evicted)
            }
            None => {
                let (admitted, rejected) = self.admit(step, output.candidates.clone());
                ctx.leaderboard.insert(admitted.iter().cloned());
                (admitted, rejected.into_iter().map(|c| c.id).collect())
            }
        };
        if !evicted.is_empty() {
            ctx.events.info(
                Stage::ModelSelection,
                format!("{id} evicted {}", evicted.join(", ")),
            );
            self.evictions.lock().extend(evicted);
        }
        ctx.record(StepRecord {
            step: id.clone(),
            kind: def.kind,
            algo: def.algo,
            candidates: kept.into_iter().map(|c| c.id).collect(),
        });

        self.credit(work, parent);
        step.transition(StepEvent::Complete);

        let state = output.to_state(&id);
        match state.status {
            ResultStatus::Failed => ctx.events.warn(Stage::ModelTraining, format!("{state}")),
            _ => ctx.events.info(Stage::ModelTraining, format!("Completed {state}")),
        }
        state
    }

    /// Splits `candidates` into those the model budget admits and the rest.
    /// Meta candidates never count against the budget.
    fn admit(&self, step: &Step, candidates: Vec<Candidate>) -> (Vec<Candidate>, Vec<Candidate>) {
        let wanted = candidates.iter().filter(|c| !c.is_meta()).count();
        let mut room = if step.ignores(Constraint::ModelCount) {
            self.ctx.add_models(wanted);
            wanted
        } else {
            self.ctx.admit_models(wanted)
        };
        candidates.into_iter().partition(|c| {
            if c.is_meta() {
                return true;
            }
            if room == 0 {
                return false;
            }
            room -= 1;
            true
        })
    }
}

/// Runs steps concurrently up to a fixed degree of parallelism.
pub struct StepsExecutor {
    shared: Arc<Shared>,
    state: Mutex<ExecutorState>,
    permits: Arc<Semaphore>,
    jobs: Mutex<Vec<JoinHandle<StepResultState>>>,
}

impl StepsExecutor {
    pub fn new(ctx: Arc<RunContext>, parallelism: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx,
                credit: Mutex::new(Credit::default()),
                evictions: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(ExecutorState::Stopped),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.shared.ctx
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    /// Starts the countdown and fixes the work total progress is measured
    /// against.
    pub fn start(&self) {
        let mut state = self.state.lock();
        if *state == ExecutorState::Running {
            return;
        }
        *state = ExecutorState::Running;
        let ctx = &self.shared.ctx;
        ctx.countdown.start();
        let mut credit = self.shared.credit.lock();
        if credit.total.is_none() {
            let total = ctx.ledger.remaining_work(None);
            credit.total = Some(total);
            info!(total_work = total, items = ctx.ledger.len(), "executor started");
        }
    }

    /// Rejects further submissions. Running jobs are left to finish.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if *state == ExecutorState::Stopped {
            return;
        }
        *state = ExecutorState::Stopped;
        self.shared.ctx.countdown.stop();
        info!(progress = self.progress_credited(), "executor stopped");
    }

    /// Submits a step, waiting only for a free parallelism slot.
    pub async fn submit(&self, step: Arc<Step>, parent: Arc<dyn ProgressSink>) -> Submission {
        let id = step.global_id();
        if !self.is_running() {
            debug!(step = %id, "executor is stopped: submission rejected");
            return Submission::NotStarted(StepResultState::skipped(&id, "executor is stopped"));
        }
        let ctx = Arc::clone(&self.shared.ctx);
        let Some(work) = step
            .allocated_work(&ctx.ledger)
            .filter(|w| w.weight() > 0)
        else {
            ctx.events
                .debug(Stage::ModelTraining, format!("No work allocated for {id}"));
            step.transition(StepEvent::Skip);
            return Submission::NotStarted(StepResultState::skipped(&id, "no work allocated"));
        };

        let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
            return Submission::NotStarted(StepResultState::skipped(&id, "executor is closed"));
        };
        if !self.is_running() {
            return Submission::NotStarted(StepResultState::skipped(&id, "executor is stopped"));
        }
        // Earlier jobs may have finished while this one waited for its slot.
        if let Some(reason) = self.limit_reached(&step, parent.as_ref()) {
            drop(permit);
            return Submission::NotStarted(self.skip(&step, parent.as_ref(), reason));
        }

        parent.message(&format!("Training {id}"));
        let Some(job) = step.start(&ctx) else {
            step.transition(StepEvent::Skip);
            self.shared.credit(&work, parent.as_ref());
            ctx.events
                .info(Stage::ModelTraining, format!("Nothing to do for {id}"));
            return Submission::NotStarted(StepResultState::skipped(&id, "nothing to do"));
        };

        step.transition(StepEvent::Start);
        ctx.events.info(Stage::ModelTraining, format!("Started {id}"));
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let output = match tokio::spawn(job.future).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(step = %step.global_id(), error = %e, "job aborted");
                    JobOutput::failed(format!("job aborted: {e}"))
                }
            };
            shared.complete(&step, &work, output, parent.as_ref())
        });
        self.jobs.lock().push(handle);
        Submission::Started
    }

    /// Why `step` must not start any more, if it must not.
    pub fn limit_reached(&self, step: &Step, parent: &dyn ProgressSink) -> Option<&'static str> {
        let ctx = &self.shared.ctx;
        if parent.stop_requested() {
            return Some("job cancelled");
        }
        if !step.ignores(Constraint::Timeout) && ctx.countdown.timed_out() {
            return Some("out of time");
        }
        if !step.ignores(Constraint::ModelCount) && ctx.remaining_models() == Some(0) {
            return Some("hit the max_models limit");
        }
        None
    }

    /// Marks a step the driver decided not to run as skipped, still
    /// crediting its work.
    pub fn skip(&self, step: &Step, parent: &dyn ProgressSink, reason: &str) -> StepResultState {
        let ctx = &self.shared.ctx;
        let id = step.global_id();
        step.transition(StepEvent::Skip);
        if let Some(work) = step.allocated_work(&ctx.ledger) {
            self.shared.credit(&work, parent);
        }
        ctx.events
            .info(Stage::ModelTraining, format!("Skipping {id}: {reason}"));
        StepResultState::skipped(id, reason)
    }

    /// Waits for every job started so far.
    pub async fn wait_all(&self) -> Vec<StepResultState> {
        let handles = std::mem::take(&mut *self.jobs.lock());
        let mut states = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(state) => states.push(state),
                Err(e) => warn!(error = %e, "step observer did not finish"),
            }
        }
        states
    }

    /// Ids the host should discard, in eviction order.
    pub fn evictions(&self) -> Vec<String> {
        self.shared.evictions.lock().clone()
    }

    pub fn model_count(&self) -> usize {
        self.shared.ctx.model_count()
    }

    pub fn progress_credited(&self) -> f64 {
        self.shared.credit.lock().credited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;
    use crate::events::EventLog;
    use crate::leaderboard::{Candidate, Direction, Leaderboard, SortMetric};
    use crate::progress::ParentJob;
    use crate::registry::{
        Alias, ProviderCatalog, ResolvedStep, StepCatalog, StepRequest, StepTemplate,
        StepsRegistry,
    };
    use crate::steps::StepState;
    use crate::steps::testing::MockTrainer;
    use crate::trainer::{TrainFuture, TrainRequest, Trainer};
    use crate::work::{Algo, WorkLedger};
    use proptest::prelude::*;

    fn resolve(catalog: &StepCatalog, requests: &[StepRequest]) -> Vec<ResolvedStep> {
        StepsRegistry::new(catalog, &EventLog::new())
            .resolve(requests)
            .unwrap()
    }

    fn executor(
        steps: &[ResolvedStep],
        trainer: Arc<dyn Trainer>,
    ) -> (StepsExecutor, Vec<Arc<Step>>) {
        budgeted_executor(steps, trainer, 2, 0)
    }

    fn budgeted_executor(
        steps: &[ResolvedStep],
        trainer: Arc<dyn Trainer>,
        parallelism: usize,
        max_models: usize,
    ) -> (StepsExecutor, Vec<Arc<Step>>) {
        let ledger = Arc::new(WorkLedger::new());
        for s in steps {
            ledger.allocate(s.to_work()).unwrap();
        }
        ledger.freeze();
        let board = Leaderboard::new("lb", Some(SortMetric::new("auc", Direction::Descending)));
        let ctx = RunContext::new(ledger, Arc::new(board), trainer).with_max_models(max_models);
        let built = steps
            .iter()
            .cloned()
            .map(|s| Arc::new(Step::from_resolved(s)))
            .collect();
        (StepsExecutor::new(Arc::new(ctx), parallelism), built)
    }

    fn gbm_defaults() -> Vec<ResolvedStep> {
        resolve(
            &StepCatalog::builtin(),
            &[StepRequest::ids("GBM", ["def_1", "def_2", "def_3"])],
        )
    }

    #[tokio::test]
    async fn started_steps_credit_progress_to_exactly_one() {
        let steps = gbm_defaults();
        let (exec, steps) = executor(&steps, Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        for step in &steps {
            let submission = exec.submit(Arc::clone(step), parent.clone()).await;
            assert!(submission.is_started());
        }
        let states = exec.wait_all().await;

        assert_eq!(states.len(), 3);
        assert!(states.iter().all(|s| s.is(ResultStatus::Success)));
        assert_eq!(parent.progress(), 1.0);
        assert_eq!(exec.model_count(), 3);
        assert_eq!(exec.context().leaderboard.len(), 3);
        assert!(steps.iter().all(|s| s.state() == StepState::Completed));
    }

    #[tokio::test]
    async fn step_without_work_is_invisible_to_progress() {
        let steps = gbm_defaults();
        let (exec, _) = executor(&steps[..1], Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        let stray = Arc::new(Step::from_resolved(steps[1].clone()));
        let submission = exec.submit(Arc::clone(&stray), parent.clone()).await;
        assert!(matches!(
            submission,
            Submission::NotStarted(ref s) if s.is(ResultStatus::Skipped)
        ));
        assert_eq!(parent.progress(), 0.0);
        assert_eq!(stray.state(), StepState::Skipped);
    }

    #[tokio::test]
    async fn step_with_nothing_to_do_still_credits() {
        let catalog = StepCatalog::builtin();
        let steps = resolve(
            &catalog,
            &[
                StepRequest::ids("GLM", ["def_1"]),
                StepRequest::ids("StackedEnsemble", ["best_of_family_1"]),
            ],
        );
        let (exec, steps) = executor(&steps, Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        // An ensemble over an empty leaderboard has no base models.
        let ensemble = steps.iter().find(|s| s.definition().is_meta()).unwrap();
        let submission = exec.submit(Arc::clone(ensemble), parent.clone()).await;
        assert!(!submission.is_started());
        assert_eq!(ensemble.state(), StepState::Skipped);
        let weight = f64::from(ensemble.definition().weight);
        let total = f64::from(steps.iter().map(|s| s.definition().weight).sum::<u32>());
        assert_eq!(parent.progress(), weight / total);

        let glm = steps.iter().find(|s| !s.definition().is_meta()).unwrap();
        exec.submit(Arc::clone(glm), parent.clone()).await;
        exec.wait_all().await;
        assert_eq!(parent.progress(), 1.0);
    }

    #[tokio::test]
    async fn stopped_executor_rejects_without_credit() {
        let steps = gbm_defaults();
        let (exec, steps) = executor(&steps, Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();
        exec.stop();
        exec.stop();

        let submission = exec.submit(Arc::clone(&steps[0]), parent.clone()).await;
        assert!(!submission.is_started());
        assert_eq!(parent.progress(), 0.0);
        assert_eq!(steps[0].state(), StepState::Pending);
        assert_eq!(exec.state(), ExecutorState::Stopped);
    }

    struct PanickingTrainer;

    impl Trainer for PanickingTrainer {
        fn train(&self, _request: TrainRequest) -> TrainFuture {
            Box::pin(async { panic!("trainer exploded") })
        }
    }

    #[tokio::test]
    async fn panicking_job_completes_as_failed() {
        let steps = gbm_defaults();
        let (exec, steps) = executor(&steps[..1], Arc::new(PanickingTrainer));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        assert!(exec.submit(Arc::clone(&steps[0]), parent.clone()).await.is_started());
        let states = exec.wait_all().await;
        assert!(states[0].is(ResultStatus::Failed));
        assert!(exec.context().leaderboard.is_empty());
        assert_eq!(parent.progress(), 1.0);
        assert_eq!(steps[0].state(), StepState::Completed);
    }

    #[tokio::test]
    async fn selection_output_updates_leaderboard_and_evictions() {
        let steps = resolve(&StepCatalog::builtin(), &[StepRequest::ids("GBM", ["lr_annealing"])]);
        let better = Candidate::new("gbm_lr", Algo::Gbm).with_metric("auc", 0.95);
        let trainer = MockTrainer::new().reply(Ok(vec![better]));
        let (exec, steps) = executor(&steps, Arc::new(trainer));
        exec.context()
            .leaderboard
            .insert([Candidate::new("gbm", Algo::Gbm).with_metric("auc", 0.9)]);
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        exec.submit(Arc::clone(&steps[0]), parent.clone()).await;
        exec.wait_all().await;
        assert_eq!(exec.context().leaderboard.model_ids(), vec!["gbm_lr"]);
        assert_eq!(exec.evictions(), vec!["gbm"]);
        assert_eq!(parent.progress(), 1.0);
    }

    #[tokio::test]
    async fn skip_credits_remaining_work() {
        let steps = gbm_defaults();
        let (exec, steps) = executor(&steps, Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();
        for step in &steps {
            let state = exec.skip(step, parent.as_ref(), "time budget exhausted");
            assert!(state.is(ResultStatus::Skipped));
        }
        assert_eq!(parent.progress(), 1.0);
        assert!(exec.wait_all().await.is_empty());
    }

    #[tokio::test]
    async fn queued_step_rechecks_the_model_budget() {
        let steps = gbm_defaults();
        let (exec, steps) = budgeted_executor(&steps[..2], Arc::new(MockTrainer::new()), 1, 1);
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        assert!(exec.submit(Arc::clone(&steps[0]), parent.clone()).await.is_started());
        // Only gets a slot once the first job completed and used up the budget.
        match exec.submit(Arc::clone(&steps[1]), parent.clone()).await {
            Submission::NotStarted(state) => {
                assert!(state.is(ResultStatus::Skipped));
                assert_eq!(state.error.as_deref(), Some("hit the max_models limit"));
            }
            Submission::Started => panic!("second step started past the model budget"),
        }
        exec.wait_all().await;
        assert_eq!(exec.model_count(), 1);
        assert_eq!(parent.progress(), 1.0);
    }

    #[tokio::test]
    async fn concurrent_steps_never_exceed_the_model_budget() {
        let steps = gbm_defaults();
        let (exec, steps) = budgeted_executor(&steps, Arc::new(MockTrainer::new()), 3, 1);
        let parent = Arc::new(ParentJob::new("run"));
        exec.start();

        let mut not_started = 0;
        for step in &steps {
            if !exec.submit(Arc::clone(step), parent.clone()).await.is_started() {
                not_started += 1;
            }
        }
        exec.wait_all().await;
        assert_eq!(exec.model_count(), 1);
        assert_eq!(exec.context().leaderboard.len(), 1);
        assert_eq!(exec.evictions().len() + not_started, 2);
        assert_eq!(parent.progress(), 1.0);
    }

    #[tokio::test]
    async fn skip_before_start_keeps_the_work() {
        let steps = gbm_defaults();
        let (exec, steps) = executor(&steps, Arc::new(MockTrainer::new()));
        let parent = Arc::new(ParentJob::new("run"));

        exec.skip(&steps[0], parent.as_ref(), "too early");
        assert_eq!(steps[0].allocated_work(&exec.context().ledger).unwrap().weight(), 10);

        exec.start();
        for step in &steps {
            exec.skip(step, parent.as_ref(), "budget");
        }
        assert_eq!(parent.progress(), 1.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn progress_always_completes(plan in prop::collection::vec((1u32..500, 0u8..3), 1..12)) {
            let templates = plan
                .iter()
                .enumerate()
                .map(|(i, (w, _))| StepTemplate::model(format!("def_{i}")).weighted(*w))
                .collect();
            let catalog = StepCatalog::new()
                .with_providers([ProviderCatalog::new("GBM", Algo::Gbm, templates)])
                .unwrap();
            let steps = resolve(&catalog, &[StepRequest::alias("GBM", Alias::All)]);

            let mut trainer = MockTrainer::new();
            for (_, mode) in plan.iter().filter(|(_, m)| *m != 1) {
                let reply = match mode {
                    2 => Err(TrainError::Failed("diverged".into())),
                    _ => Ok(vec![]),
                };
                trainer = trainer.reply(reply);
            }
            let (exec, steps) = executor(&steps, Arc::new(trainer));
            let parent = Arc::new(ParentJob::new("run"));

            let runtime = tokio::runtime::Runtime::new().unwrap();
            runtime.block_on(async {
                exec.start();
                for (step, (_, mode)) in steps.iter().zip(&plan) {
                    if *mode == 1 {
                        exec.skip(step, parent.as_ref(), "budget");
                    } else {
                        exec.submit(Arc::clone(step), parent.clone()).await;
                    }
                }
                exec.wait_all().await;
            });
            prop_assert_eq!(parent.progress(), 1.0);
            prop_assert!(steps.iter().all(|s| s.state().is_terminal()));
        }
    }
}
