use std::sync::Arc;
use std::time::Duration;

use super::{JobOutput, RunContext, StepHeader, StepJob, StepRecord, attribute};
use crate::executor::StepResultState;
use crate::events::Stage;
use crate::registry::{ResolvedStep, StepKind};
use crate::trainer::{TrainMode, TrainRequest};
use crate::work::{Algo, Work};

const DEFAULT_MAX_SUB_STEPS: usize = 2;

/// Resumes the best hyperparameter searches of the run so far.
///
/// Its weight is reserved in the ledger at planning time; the sub-steps it
/// splits that weight across are only known once earlier steps finished.
pub struct DynamicStep {
    pub(super) header: StepHeader,
    max_sub_steps: usize,
}

#[derive(Debug, Clone)]
struct SubStep {
    id: String,
    grid: String,
    algo: Algo,
    weight: u32,
    max_models: Option<usize>,
    max_runtime: Option<Duration>,
}

impl DynamicStep {
    pub fn new(def: ResolvedStep) -> Self {
        let max_sub_steps = def.template.max_sub_steps.unwrap_or(DEFAULT_MAX_SUB_STEPS);
        Self {
            header: StepHeader::new(def),
            max_sub_steps,
        }
    }

    pub(super) fn start(&self, work: &Arc<Work>, ctx: &Arc<RunContext>) -> Option<StepJob> {
        let def = self.header.definition();
        let subs = self.plan_sub_steps(work, ctx);
        if subs.is_empty() {
            ctx.events.info(
                Stage::ModelTraining,
                format!("No search worth resuming for {}", def.global_id()),
            );
            return None;
        }
        for sub in &subs {
            ctx.events.debug(
                Stage::ModelTraining,
                format!("{} planned sub-step {} (weight {})", def.global_id(), sub.id, sub.weight),
            );
        }

        let trainer = Arc::clone(&ctx.trainer);
        let source = def.global_id();
        let group = def.priority_group;
        let seed = ctx.seed;
        let resolution = ctx.resolution;
        Some(StepJob::new(async move {
            let mut candidates = Vec::new();
            let mut sub_states = Vec::with_capacity(subs.len());
            for sub in subs {
                if sub.max_models == Some(0) {
                    sub_states.push(StepResultState::skipped(&sub.id, "no model budget left"));
                    continue;
                }
                let request = TrainRequest::new(
                    &source,
                    sub.algo,
                    group,
                    TrainMode::Resume {
                        grid: sub.grid.clone(),
                        max_models: sub.max_models,
                    },
                )
                .with_max_runtime(sub.max_runtime)
                .with_seed(seed);
                match trainer.train(request).await {
                    Ok(mut trained) => {
                        attribute(&mut trained, &source, group);
                        candidates.extend(trained);
                        sub_states.push(StepResultState::success(&sub.id));
                    }
                    Err(e) => {
                        let out = JobOutput::from_train_error(e);
                        sub_states.push(out.to_state(&sub.id));
                    }
                }
            }
            let state = StepResultState::composite(&source, sub_states, resolution);
            JobOutput {
                status: state.status,
                error: state.error,
                candidates,
                selection: None,
                sub_states: state.sub_states,
            }
        }))
    }

    /// Grids that still have a candidate on the leaderboard, best first.
    fn plan_sub_steps(&self, work: &Work, ctx: &RunContext) -> Vec<SubStep> {
        let mut grids: Vec<(usize, StepRecord)> = ctx
            .history()
            .into_iter()
            .filter(|r| r.kind == StepKind::Grid && ctx.trainer.is_available(r.algo))
            .filter_map(|r| {
                let best = r
                    .candidates
                    .iter()
                    .filter_map(|id| ctx.leaderboard.rank_of(id))
                    .min()?;
                Some((best, r))
            })
            .collect();
        grids.sort_by_key(|(rank, _)| *rank);
        grids.truncate(self.max_sub_steps);
        if grids.is_empty() {
            return Vec::new();
        }

        let count = grids.len();
        let weights = split(work.weight() as usize, count);
        let total: usize = weights.iter().sum();
        let time = ctx.time_share(work, None);
        let models = ctx.remaining_models().map(|r| split(r, count));
        grids
            .into_iter()
            .zip(weights)
            .enumerate()
            .map(|(i, ((_, record), weight))| SubStep {
                id: format!("resume_{}", record.step.replace(':', "_")),
                grid: record.step,
                algo: record.algo,
                weight: weight as u32,
                max_models: models.as_ref().map(|m| m[i]),
                max_runtime: time.map(|d| {
                    if total == 0 {
                        Duration::ZERO
                    } else {
                        d.mul_f64(weight as f64 / total as f64)
                    }
                }),
            })
            .collect()
    }
}

/// Splits `amount` into `parts` near-equal shares; the first shares absorb
/// the remainder.
fn split(amount: usize, parts: usize) -> Vec<usize> {
    let base = amount / parts;
    let rest = amount % parts;
    (0..parts).map(|i| base + usize::from(i < rest)).collect()
}
