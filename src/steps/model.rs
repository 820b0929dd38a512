use std::collections::HashSet;
use std::sync::Arc;

use super::{JobOutput, RunContext, StepHeader, StepJob, attribute};
use crate::events::Stage;
use crate::leaderboard::Candidate;
use crate::registry::{Constraint, MetaBase, MetaTemplate, ResolvedStep};
use crate::trainer::{TrainMode, TrainRequest};
use crate::work::Work;

/// Trains exactly one candidate. With a meta template, that candidate is
/// an ensemble over earlier candidates.
pub struct ModelStep {
    pub(super) header: StepHeader,
    meta: Option<MetaTemplate>,
}

impl ModelStep {
    pub fn new(def: ResolvedStep) -> Self {
        let meta = def.template.meta.clone();
        Self {
            header: StepHeader::new(def),
            meta,
        }
    }

    pub(super) fn start(&self, work: &Arc<Work>, ctx: &Arc<RunContext>) -> Option<StepJob> {
        let def = self.header.definition();
        let mode = match &self.meta {
            None => TrainMode::Single,
            Some(meta) => TrainMode::Ensemble {
                base_models: self.base_models(meta, ctx)?,
            },
        };
        let max_runtime = if self.header.ignores(Constraint::Timeout) {
            None
        } else {
            ctx.time_share(work, None)
        };
        let request = TrainRequest::new(def.global_id(), def.algo, def.priority_group, mode)
            .with_max_runtime(max_runtime)
            .with_seed(ctx.seed);
        let training = ctx.trainer.train(request);
        let source = def.global_id();
        let group = def.priority_group;
        Some(StepJob::new(async move {
            match training.await {
                Ok(mut candidates) => {
                    attribute(&mut candidates, &source, group);
                    JobOutput::success(candidates)
                }
                Err(e) => JobOutput::from_train_error(e),
            }
        }))
    }

    /// Picks base models among non-meta candidates of the aggregated groups.
    ///
    /// `None` with fewer than two candidates, or when an ensemble over the
    /// same set is already on the leaderboard.
    fn base_models(&self, meta: &MetaTemplate, ctx: &RunContext) -> Option<Vec<String>> {
        let def = self.header.definition();
        let up_to = def.aggregates_up_to.unwrap_or(u32::MAX);
        let models = ctx.leaderboard.models();
        let pool = models
            .iter()
            .filter(|c| !c.is_meta() && c.priority_group <= up_to);

        let base: Vec<String> = match meta.base {
            MetaBase::All => pool.map(|c| c.id.clone()).collect(),
            MetaBase::Monotonic => pool.filter(|c| c.monotone).map(|c| c.id.clone()).collect(),
            MetaBase::BestOfFamily => {
                let mut families = HashSet::new();
                pool.filter(|c| families.insert(c.algo))
                    .map(|c| c.id.clone())
                    .collect()
            }
        };

        if base.len() < 2 {
            ctx.events.info(
                Stage::ModelTraining,
                format!(
                    "Not enough models to build {}: found {}, need at least 2",
                    def.global_id(),
                    base.len()
                ),
            );
            return None;
        }
        if models.iter().any(|c| c.is_meta() && same_set(c, &base)) {
            ctx.events.info(
                Stage::ModelTraining,
                format!(
                    "Skipping {}: an ensemble over the same base models already exists",
                    def.global_id()
                ),
            );
            return None;
        }
        Some(base)
    }
}

fn same_set(ensemble: &Candidate, base: &[String]) -> bool {
    ensemble.base_models.len() == base.len()
        && base.iter().all(|id| ensemble.base_models.contains(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrainError;
    use crate::executor::ResultStatus;
    use crate::leaderboard::{Direction, Leaderboard, SortMetric};
    use crate::registry::{Alias, StepCatalog, StepRequest, StepsRegistry};
    use crate::events::EventLog;
    use crate::steps::Step;
    use crate::steps::testing::MockTrainer;
    use crate::work::{Algo, WorkLedger};

    fn plan(requests: &[StepRequest]) -> Vec<ResolvedStep> {
        let catalog = StepCatalog::builtin();
        let events = EventLog::new();
        StepsRegistry::new(&catalog, &events).resolve(requests).unwrap()
    }

    fn context(steps: &[ResolvedStep], trainer: MockTrainer) -> Arc<RunContext> {
        let ledger = Arc::new(WorkLedger::new());
        for s in steps {
            ledger.allocate(s.to_work()).unwrap();
        }
        ledger.freeze();
        let board = Leaderboard::new("lb", Some(SortMetric::new("auc", Direction::Descending)));
        Arc::new(RunContext::new(ledger, Arc::new(board), Arc::new(trainer)))
    }

    fn scored(id: &str, algo: Algo, auc: f64, group: u32) -> Candidate {
        let mut c = Candidate::new(id, algo).with_metric("auc", auc);
        c.priority_group = group;
        c
    }

    #[tokio::test]
    async fn plain_model_step_trains_one_attributed_candidate() {
        let steps = plan(&[StepRequest::ids("GLM", ["def_1"])]);
        let ctx = context(&steps, MockTrainer::new());
        let step = Step::from_resolved(steps[0].clone());

        let job = step.start(&ctx).unwrap();
        let out = job.future.await;
        assert_eq!(out.status, ResultStatus::Success);
        assert_eq!(out.candidates.len(), 1);
        assert_eq!(out.candidates[0].source_step.as_deref(), Some("GLM:def_1"));
        assert_eq!(out.candidates[0].priority_group, 1);
    }

    #[tokio::test]
    async fn failed_fit_is_reported_not_raised() {
        let steps = plan(&[StepRequest::ids("GLM", ["def_1"])]);
        let trainer = MockTrainer::new().reply(Err(TrainError::Failed("diverged".into())));
        let ctx = context(&steps, trainer);
        let out = Step::from_resolved(steps[0].clone())
            .start(&ctx)
            .unwrap()
            .future
            .await;
        assert_eq!(out.status, ResultStatus::Failed);
        assert!(out.candidates.is_empty());
        assert_eq!(out.error.as_deref(), Some("diverged"));
    }

    #[test]
    fn ensemble_needs_two_base_models() {
        let steps = plan(&[
            StepRequest::ids("GBM", ["def_1"]),
            StepRequest::alias("StackedEnsemble", Alias::All),
        ]);
        let ctx = context(&steps, MockTrainer::new());
        ctx.leaderboard.insert([scored("gbm", Algo::Gbm, 0.8, 1)]);
        let best_of_family = Step::from_resolved(steps[1].clone());
        assert!(best_of_family.start(&ctx).is_none());
    }

    #[tokio::test]
    async fn best_of_family_picks_one_per_algo_within_groups() {
        let steps = plan(&[
            StepRequest::ids("GLM", ["def_1"]),
            StepRequest::ids("GBM", ["def_1"]),
            StepRequest::ids("StackedEnsemble", ["best_of_family_1"]),
        ]);
        let trainer = Arc::new(MockTrainer::new());
        let ledger = Arc::new(WorkLedger::new());
        for s in &steps {
            ledger.allocate(s.to_work()).unwrap();
        }
        let board = Leaderboard::new("lb", Some(SortMetric::new("auc", Direction::Descending)));
        let ctx = Arc::new(RunContext::new(ledger, Arc::new(board), trainer.clone()));
        ctx.leaderboard.insert([
            scored("gbm_a", Algo::Gbm, 0.9, 1),
            scored("gbm_b", Algo::Gbm, 0.85, 1),
            scored("glm", Algo::Glm, 0.7, 1),
            scored("gbm_late", Algo::Gbm, 0.99, 2),
        ]);

        let step = Step::from_resolved(steps[2].clone());
        let out = step.start(&ctx).unwrap().future.await;
        assert!(out.candidates[0].is_meta());
        match &trainer.requests()[0].mode {
            TrainMode::Ensemble { base_models } => {
                assert_eq!(base_models, &vec!["gbm_a".to_string(), "glm".to_string()]);
            }
            other => panic!("unexpected mode {other:?}"),
        }

        ctx.leaderboard.insert(out.candidates);
        assert!(step.start(&ctx).is_none(), "same base set must not be rebuilt");
    }

    #[tokio::test]
    async fn monotonic_ensemble_stacks_only_constrained_models() {
        let steps = plan(&[
            StepRequest::ids("GBM", ["def_1"]),
            StepRequest::ids("StackedEnsemble", ["monotonic_1"]),
        ]);
        let trainer = Arc::new(MockTrainer::new());
        let ledger = Arc::new(WorkLedger::new());
        for s in &steps {
            ledger.allocate(s.to_work()).unwrap();
        }
        let board = Leaderboard::new("lb", Some(SortMetric::new("auc", Direction::Descending)));
        let ctx = Arc::new(RunContext::new(ledger, Arc::new(board), trainer.clone()));
        let step = Step::from_resolved(steps[1].clone());

        ctx.leaderboard.insert([
            scored("gbm_mono", Algo::Gbm, 0.8, 1).monotone(),
            scored("gbm_free", Algo::Gbm, 0.9, 1),
        ]);
        assert!(step.start(&ctx).is_none(), "one monotone model is not enough");

        ctx.leaderboard
            .insert([scored("xgb_mono", Algo::XGBoost, 0.85, 1).monotone()]);
        step.start(&ctx).unwrap().future.await;
        match &trainer.requests()[0].mode {
            TrainMode::Ensemble { base_models } => {
                assert_eq!(base_models, &vec!["xgb_mono".to_string(), "gbm_mono".to_string()]);
            }
            other => panic!("unexpected mode {other:?}"),
        }
    }

    #[test]
    fn exhausted_model_budget_means_no_job() {
        let steps = plan(&[StepRequest::ids("GLM", ["def_1"])]);
        let ledger = Arc::new(WorkLedger::new());
        ledger.allocate(steps[0].to_work()).unwrap();
        let board = Leaderboard::new("lb", Some(SortMetric::new("auc", Direction::Descending)));
        let ctx = Arc::new(
            RunContext::new(ledger, Arc::new(board), Arc::new(MockTrainer::new())).with_max_models(2),
        );
        let step = Step::from_resolved(steps[0].clone());
        ctx.add_models(1);
        assert!(step.start(&ctx).is_some());
        ctx.add_models(1);
        assert!(step.start(&ctx).is_none());
    }
}
