use std::sync::Arc;

use super::{JobOutput, RunContext, StepHeader, StepJob, attribute};
use crate::events::Stage;
use crate::registry::{Constraint, ResolvedStep};
use crate::selection::StrategySpec;
use crate::trainer::{TrainMode, TrainRequest};
use crate::work::Work;

/// Trains refinements of the current family leader, then lets a selection
/// strategy decide which candidates survive.
pub struct SelectionStep {
    pub(super) header: StepHeader,
    strategy: StrategySpec,
}

impl SelectionStep {
    pub fn new(def: ResolvedStep) -> Self {
        let strategy = def
            .template
            .strategy
            .clone()
            .unwrap_or(StrategySpec::KeepBestN { n: 1 });
        Self {
            header: StepHeader::new(def),
            strategy,
        }
    }

    pub fn strategy(&self) -> &StrategySpec {
        &self.strategy
    }

    pub(super) fn start(&self, work: &Arc<Work>, ctx: &Arc<RunContext>) -> Option<StepJob> {
        let def = self.header.definition();
        let Some(sort) = ctx.sort_metric() else {
            ctx.events.info(
                Stage::ModelSelection,
                format!("Skipping {}: the leaderboard has no sort metric", def.global_id()),
            );
            return None;
        };
        let Some(base) = ctx
            .leaderboard
            .models()
            .into_iter()
            .find(|c| c.algo == def.algo && !c.is_meta())
        else {
            ctx.events.info(
                Stage::ModelSelection,
                format!("Skipping {}: no {} model to improve on", def.global_id(), def.algo),
            );
            return None;
        };

        let max_runtime = if self.header.ignores(Constraint::Timeout) {
            None
        } else {
            ctx.time_share(work, None)
        };
        let request = TrainRequest::new(
            def.global_id(),
            def.algo,
            def.priority_group,
            TrainMode::Exploit { base: base.clone() },
        )
        .with_max_runtime(max_runtime)
        .with_seed(ctx.seed);
        let training = ctx.trainer.train(request);
        let strategy = self.strategy.build(sort);
        let events = Arc::clone(&ctx.events);
        let source = def.global_id();
        let group = def.priority_group;

        Some(StepJob::new(async move {
            match training.await {
                Ok(mut produced) => {
                    attribute(&mut produced, &source, group);
                    // Only the seed competes with its refinements.
                    let selection = strategy.select(std::slice::from_ref(&base), &produced);
                    events.info(
                        Stage::ModelSelection,
                        format!(
                            "Selection for {source}: added {:?}, removed {:?}",
                            selection.added_ids(),
                            selection.removed_ids()
                        ),
                    );
                    JobOutput::selected(produced, selection)
                }
                Err(e) => JobOutput::from_train_error(e),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::leaderboard::{Candidate, Direction, Leaderboard, SortMetric};
    use crate::registry::{StepCatalog, StepRequest, StepsRegistry};
    use crate::steps::Step;
    use crate::steps::testing::MockTrainer;
    use crate::work::{Algo, WorkLedger};

    fn setup(trainer: MockTrainer, sorted: bool) -> (Step, Arc<RunContext>) {
        let catalog = StepCatalog::builtin();
        let events = EventLog::new();
        let steps = StepsRegistry::new(&catalog, &events)
            .resolve(&[StepRequest::ids("GBM", ["lr_annealing"])])
            .unwrap();
        let ledger = Arc::new(WorkLedger::new());
        ledger.allocate(steps[0].to_work()).unwrap();
        let sort = sorted.then(|| SortMetric::new("auc", Direction::Descending));
        let ctx = RunContext::new(
            ledger,
            Arc::new(Leaderboard::new("lb", sort)),
            Arc::new(trainer),
        );
        (Step::from_resolved(steps[0].clone()), Arc::new(ctx))
    }

    #[tokio::test]
    async fn keeps_the_better_of_leader_and_refinement() {
        let better = Candidate::new("gbm_lr", Algo::Gbm).with_metric("auc", 0.95);
        let (step, ctx) = setup(MockTrainer::new().reply(Ok(vec![better])), true);
        ctx.leaderboard.insert([
            Candidate::new("gbm", Algo::Gbm).with_metric("auc", 0.9),
            Candidate::new("glm", Algo::Glm).with_metric("auc", 0.7),
        ]);

        let out = step.start(&ctx).unwrap().future.await;
        let selection = out.selection.unwrap();
        assert_eq!(selection.added_ids(), vec!["gbm_lr"]);
        assert_eq!(selection.removed_ids(), vec!["gbm"]);
        assert_eq!(out.candidates[0].source_step.as_deref(), Some("GBM:lr_annealing"));
    }

    #[tokio::test]
    async fn worse_refinement_is_discarded() {
        let worse = Candidate::new("gbm_lr", Algo::Gbm).with_metric("auc", 0.5);
        let (step, ctx) = setup(MockTrainer::new().reply(Ok(vec![worse])), true);
        ctx.leaderboard
            .insert([Candidate::new("gbm", Algo::Gbm).with_metric("auc", 0.9)]);
        let selection = step.start(&ctx).unwrap().future.await.selection.unwrap();
        assert!(selection.is_empty());
    }

    #[test]
    fn no_family_leader_means_no_job() {
        let (step, ctx) = setup(MockTrainer::new(), true);
        ctx.leaderboard
            .insert([Candidate::new("glm", Algo::Glm).with_metric("auc", 0.7)]);
        assert!(step.start(&ctx).is_none());
    }

    #[test]
    fn unsorted_leaderboard_means_no_job() {
        let (step, ctx) = setup(MockTrainer::new(), false);
        ctx.leaderboard.insert([Candidate::new("gbm", Algo::Gbm)]);
        assert!(step.start(&ctx).is_none());
    }

    #[tokio::test]
    async fn only_the_seed_competes_with_the_refinement() {
        let worse = Candidate::new("gbm_lr", Algo::Gbm).with_metric("auc", 0.5);
        let (step, ctx) = setup(MockTrainer::new().reply(Ok(vec![worse])), true);
        ctx.leaderboard.insert([
            Candidate::new("gbm_a", Algo::Gbm).with_metric("auc", 0.9),
            Candidate::new("gbm_b", Algo::Gbm).with_metric("auc", 0.8),
            Candidate::new("gbm_c", Algo::Gbm).with_metric("auc", 0.7),
        ]);
        let selection = step.start(&ctx).unwrap().future.await.selection.unwrap();
        assert!(selection.added_ids().is_empty());
        assert!(selection.removed_ids().is_empty());

        let better = Candidate::new("gbm_lr", Algo::Gbm).with_metric("auc", 0.95);
        let (step, ctx) = setup(MockTrainer::new().reply(Ok(vec![better])), true);
        ctx.leaderboard.insert([
            Candidate::new("gbm_a", Algo::Gbm).with_metric("auc", 0.9),
            Candidate::new("gbm_b", Algo::Gbm).with_metric("auc", 0.8),
        ]);
        let selection = step.start(&ctx).unwrap().future.await.selection.unwrap();
        assert_eq!(selection.added_ids(), vec!["gbm_lr"]);
        assert_eq!(selection.removed_ids(), vec!["gbm_a"]);
    }

    #[test]
    fn builtin_refinements_keep_a_single_model() {
        let Step::Selection(step) = setup(MockTrainer::new(), true).0 else {
            panic!("expected a selection step");
        };
        assert_eq!(step.strategy(), &StrategySpec::KeepBestN { n: 1 });
    }
}
