use std::sync::Arc;

use super::{JobOutput, RunContext, StepHeader, StepJob, attribute};
use crate::events::Stage;
use crate::registry::{Constraint, ResolvedStep};
use crate::trainer::{TrainMode, TrainRequest};
use crate::work::{Algo, Work};

/// Runs a hyperparameter search sized by its share of the remaining budget.
pub struct GridStep {
    pub(super) header: StepHeader,
    search_size: Option<usize>,
}

impl GridStep {
    pub fn new(def: ResolvedStep) -> Self {
        let search_size = def.template.search_size;
        Self {
            header: StepHeader::new(def),
            search_size,
        }
    }

    pub(super) fn start(&self, work: &Arc<Work>, ctx: &Arc<RunContext>) -> Option<StepJob> {
        let def = self.header.definition();
        let max_models = match ctx.remaining_models() {
            Some(remaining) if !self.header.ignores(Constraint::ModelCount) => {
                let cap = model_cap(remaining, work, ctx);
                if cap == 0 {
                    ctx.events.info(
                        Stage::ModelTraining,
                        format!("No model budget left for {}", def.global_id()),
                    );
                    return None;
                }
                Some(self.search_size.map_or(cap, |size| size.min(cap)))
            }
            _ => self.search_size,
        };

        let max_runtime = if self.header.ignores(Constraint::Timeout) {
            None
        } else {
            let group = work.priority_group;
            let same_group = move |w: &Work| w.priority_group == group;
            ctx.time_share(work, Some(&same_group))
        };
        ctx.events.debug(
            Stage::ModelTraining,
            format!(
                "Hyperparameter search {}: max models {}, max runtime {}",
                def.global_id(),
                max_models.map_or_else(|| "unbounded".to_string(), |n| n.to_string()),
                max_runtime.map_or_else(|| "unbounded".to_string(), |d| format!("{d:?}")),
            ),
        );

        let request = TrainRequest::new(
            def.global_id(),
            def.algo,
            def.priority_group,
            TrainMode::Search { max_models },
        )
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
}

/// `ceil(remaining × share of the remaining exploration work)`. Ensembles
/// are left out of the exploration budget.
fn model_cap(remaining: usize, work: &Work, ctx: &RunContext) -> usize {
    let exploration = |w: &Work| w.job_type.is_exploration() && w.algo != Algo::StackedEnsemble;
    let ratio = ctx.ledger.remaining_work_ratio(work, Some(&exploration));
    (remaining as f64 * ratio).ceil() as usize
}
