//! Schedulable units of work.
//!
//! [`Step`] is a closed set of variants sharing one contract:
//! [`Step::allocated_work`] tells whether the step takes part in the run's
//! budget at all, and [`Step::start`] either hands back a [`StepJob`] to
//! await or `None` when there is nothing to do. Neither fails for a step
//! that simply does not apply.

mod context;
mod dynamic;
mod exploit;
mod grid;
mod model;
pub mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::TrainError;
use crate::executor::{ResultStatus, StepResultState};
use crate::leaderboard::Candidate;
use crate::registry::{Constraint, ResolvedStep, StepKind};
use crate::selection::Selection;
use crate::work::{Work, WorkLedger};

pub use context::{RunContext, StepRecord};
pub use dynamic::DynamicStep;
pub use exploit::SelectionStep;
pub use grid::GridStep;
pub use model::ModelStep;
pub use state::{Lifecycle, StateMachine, StepEvent, StepState, Transition};

pub type JobFuture = Pin<Box<dyn Future<Output = JobOutput> + Send>>;

/// A started unit of work. Awaiting it never fails: training errors are
/// reported in the [`JobOutput`].
pub struct StepJob {
    pub future: JobFuture,
}

impl StepJob {
    pub fn new(future: impl Future<Output = JobOutput> + Send + 'static) -> Self {
        Self {
            future: Box::pin(future),
        }
    }
}

/// What a finished job hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub status: ResultStatus,
    pub error: Option<String>,
    /// Every candidate the job trained.
    pub candidates: Vec<Candidate>,
    /// Selection steps only: which candidates to keep. When set, only
    /// `selection.add` enters the leaderboard.
    pub selection: Option<Selection>,
    pub sub_states: Vec<StepResultState>,
}

impl JobOutput {
    pub fn success(candidates: Vec<Candidate>) -> Self {
        Self {
            status: ResultStatus::Success,
            error: None,
            candidates,
            selection: None,
            sub_states: Vec::new(),
        }
    }

    pub fn selected(candidates: Vec<Candidate>, selection: Selection) -> Self {
        Self {
            selection: Some(selection),
            ..Self::success(candidates)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Failed,
            error: Some(error.into()),
            ..Self::success(Vec::new())
        }
    }

    pub fn from_train_error(error: TrainError) -> Self {
        match error {
            TrainError::Failed(msg) => Self::failed(msg),
            TrainError::Cancelled => Self {
                status: ResultStatus::Cancelled,
                ..Self::success(Vec::new())
            },
        }
    }

    pub fn to_state(&self, id: impl Into<String>) -> StepResultState {
        StepResultState {
            id: id.into(),
            status: self.status,
            error: self.error.clone(),
            sub_states: self.sub_states.clone(),
        }
    }
}

/// Stamps candidates with the step that produced them.
pub(crate) fn attribute(candidates: &mut [Candidate], source: &str, group: u32) {
    for c in candidates {
        c.source_step = Some(source.to_string());
        c.priority_group = group;
    }
}

/// Definition and lifecycle shared by every step variant.
#[derive(Debug)]
pub struct StepHeader {
    def: ResolvedStep,
    lifecycle: Mutex<Lifecycle>,
}

impl StepHeader {
    pub fn new(def: ResolvedStep) -> Self {
        Self {
            def,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn definition(&self) -> &ResolvedStep {
        &self.def
    }

    pub fn ignores(&self, constraint: Constraint) -> bool {
        self.def.ignores(constraint)
    }
}

pub enum Step {
    Model(ModelStep),
    Grid(GridStep),
    Selection(SelectionStep),
    Dynamic(DynamicStep),
}

impl Step {
    pub fn from_resolved(def: ResolvedStep) -> Self {
        match def.kind {
            StepKind::Model => Step::Model(ModelStep::new(def)),
            StepKind::Grid => Step::Grid(GridStep::new(def)),
            StepKind::Selection => Step::Selection(SelectionStep::new(def)),
            StepKind::Dynamic => Step::Dynamic(DynamicStep::new(def)),
        }
    }

    pub fn header(&self) -> &StepHeader {
        match self {
            Step::Model(s) => &s.header,
            Step::Grid(s) => &s.header,
            Step::Selection(s) => &s.header,
            Step::Dynamic(s) => &s.header,
        }
    }

    pub fn definition(&self) -> &ResolvedStep {
        &self.header().def
    }

    pub fn global_id(&self) -> String {
        self.definition().global_id()
    }

    pub fn ignores(&self, constraint: Constraint) -> bool {
        self.header().ignores(constraint)
    }

    pub fn state(&self) -> StepState {
        self.header().lifecycle.lock().state
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.header().lifecycle.lock().clone()
    }

    pub fn transition(&self, event: StepEvent) -> Transition {
        StateMachine::next(&mut self.header().lifecycle.lock(), event)
    }

    /// The ledger entry of this step, or `None` when the step does not
    /// apply to this run.
    pub fn allocated_work(&self, ledger: &WorkLedger) -> Option<Arc<Work>> {
        let def = self.definition();
        ledger.get(&def.id, &def.provider)
    }

    /// Starts the step, or returns `None` when there is nothing to run.
    pub fn start(&self, ctx: &Arc<RunContext>) -> Option<StepJob> {
        let work = self.allocated_work(&ctx.ledger)?;
        if !ctx.trainer.is_available(self.definition().algo) {
            ctx.events.info(
                crate::events::Stage::ModelTraining,
                format!(
                    "{} is not available: skipping {}",
                    self.definition().algo,
                    self.global_id()
                ),
            );
            return None;
        }
        if !self.ignores(Constraint::ModelCount) && ctx.remaining_models() == Some(0) {
            ctx.events.info(
                crate::events::Stage::ModelTraining,
                format!("No model budget left for {}", self.global_id()),
            );
            return None;
        }
        match self {
            Step::Model(s) => s.start(&work, ctx),
            Step::Grid(s) => s.start(&work, ctx),
            Step::Selection(s) => s.start(&work, ctx),
            Step::Dynamic(s) => s.start(&work, ctx),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use crate::error::TrainError;
    use crate::leaderboard::Candidate;
    use crate::trainer::{TrainFuture, TrainMode, TrainRequest, Trainer};
    use crate::work::Algo;

    /// Scripted trainer: replies from a queue, then falls back to one
    /// candidate per request scored by request order.
    #[derive(Default)]
    pub struct MockTrainer {
        pub replies: Mutex<VecDeque<Result<Vec<Candidate>, TrainError>>>,
        pub requests: Mutex<Vec<TrainRequest>>,
        pub unavailable: Vec<Algo>,
        counter: AtomicUsize,
    }

    impl MockTrainer {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn reply(self, reply: Result<Vec<Candidate>, TrainError>) -> Self {
            self.replies.lock().push_back(reply);
            self
        }

        pub fn requests(&self) -> Vec<TrainRequest> {
            self.requests.lock().clone()
        }
    }

    impl Trainer for MockTrainer {
        fn is_available(&self, algo: Algo) -> bool {
            !self.unavailable.contains(&algo)
        }

        fn train(&self, request: TrainRequest) -> TrainFuture {
            self.requests.lock().push(request.clone());
            let reply = self.replies.lock().pop_front().unwrap_or_else(|| {
                let n = self.counter.fetch_add(1, Ordering::Relaxed);
                let algo = match request.mode {
                    TrainMode::Ensemble { .. } => Algo::StackedEnsemble,
                    _ => request.algo,
                };
                let base = match &request.mode {
                    TrainMode::Ensemble { base_models } => base_models.clone(),
                    _ => Vec::new(),
                };
                Ok(vec![
                    Candidate::new(format!("{}_{n}", request.step), algo)
                        .with_metric("auc", 0.5 + n as f64 / 100.0)
                        .with_base_models(base),
                ])
            });
            Box::pin(async move { reply })
        }
    }
}
