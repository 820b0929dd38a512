//! Resolution of modeling plans into ordered, weighted steps.
//!
//! Resolution runs in two passes. The first resolves every plain template
//! and fixes the set of priority groups; the second expands meta steps
//! (ensembles) against that set, one instance per selected group, named
//! `<name>_<group>` and scheduled right after the group it aggregates.

pub mod catalog;
pub mod request;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AutoMlError, Result};
use crate::events::{EventLog, Stage};
use crate::work::{Algo, JobType, Work};

pub use catalog::{
    Constraint, MetaBase, MetaGroups, MetaTemplate, ProviderCatalog, StepCatalog, StepKind,
    StepTemplate,
};
pub use request::{Alias, Selector, StepOverride, StepRequest};

/// A concrete step of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedStep {
    pub id: String,
    pub provider: String,
    pub algo: Algo,
    pub priority_group: u32,
    pub weight: u32,
    pub kind: StepKind,
    pub template: StepTemplate,
    /// Meta instances only: highest group whose candidates they aggregate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregates_up_to: Option<u32>,
}

impl ResolvedStep {
    /// `provider:id`, unique within a plan.
    pub fn global_id(&self) -> String {
        format!("{}:{}", self.provider, self.id)
    }

    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    pub fn is_meta(&self) -> bool {
        self.template.is_meta()
    }

    pub fn ignores(&self, constraint: Constraint) -> bool {
        self.template.ignores(constraint)
    }

    /// The ledger entry this step accounts its budget against.
    pub fn to_work(&self) -> Work {
        Work::new(
            &self.id,
            &self.provider,
            self.algo,
            self.job_type(),
            self.priority_group,
            self.weight,
        )
    }
}

impl fmt::Display for ResolvedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?}, group={}, weight={}]",
            self.global_id(),
            self.kind,
            self.priority_group,
            self.weight
        )
    }
}

#[derive(Debug)]
struct MetaRequest<'c> {
    slot: usize,
    provider: &'c ProviderCatalog,
    template: &'c StepTemplate,
    weight: Option<u32>,
    group: Option<u32>,
    /// `Some` for a concrete instance id, `None` for a generic request.
    instance: Option<u32>,
}

/// Resolves [`StepRequest`]s against a [`StepCatalog`].
pub struct StepsRegistry<'a> {
    catalog: &'a StepCatalog,
    events: &'a EventLog,
}

impl<'a> StepsRegistry<'a> {
    pub fn new(catalog: &'a StepCatalog, events: &'a EventLog) -> Self {
        Self { catalog, events }
    }

    /// Resolves `requests` into steps ordered by ascending priority group,
    /// stable on request order within a group.
    ///
    /// Unknown providers fail the whole call; unknown step ids are skipped
    /// with a warning event.
    pub fn resolve(&self, requests: &[StepRequest]) -> Result<Vec<ResolvedStep>> {
        let mut slots: Vec<Vec<ResolvedStep>> = vec![Vec::new(); requests.len()];
        let mut metas = Vec::new();

        for (slot, request) in requests.iter().enumerate() {
            let provider = self.catalog.provider(&request.name).ok_or_else(|| {
                AutoMlError::InvalidArgument(format!(
                    "Missing provider for modeling step '{}'",
                    request.name
                ))
            })?;
            for (template, group, weight, instance) in self.select(provider, &request.selector) {
                if template.is_meta() {
                    metas.push(MetaRequest {
                        slot,
                        provider,
                        template,
                        weight,
                        group,
                        instance,
                    });
                } else {
                    slots[slot].push(resolve_template(provider, template, group, weight));
                }
            }
        }

        let present: Vec<u32> = slots
            .iter()
            .flatten()
            .map(|s| s.priority_group)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for meta in metas {
            let instances = match meta.instance {
                Some(g) => vec![g],
                None => {
                    if meta.group.is_some() {
                        self.events.warn(
                            Stage::Planning,
                            format!(
                                "Group override ignored for generic meta step '{}' in provider '{}'.",
                                meta.template.id, meta.provider.name
                            ),
                        );
                    }
                    meta.template
                        .meta
                        .as_ref()
                        .map(|m| m.groups.select(&present))
                        .unwrap_or_default()
                }
            };
            for aggregated in instances {
                let next = aggregated.checked_add(1).ok_or_else(|| {
                    AutoMlError::InvalidArgument(format!(
                        "no priority group left after {aggregated} for meta step '{}'",
                        meta.template.id
                    ))
                })?;
                let group = match meta.instance {
                    Some(_) => meta.group.unwrap_or(next),
                    None => next,
                };
                slots[meta.slot].push(ResolvedStep {
                    id: format!("{}_{aggregated}", meta.template.id),
                    provider: meta.provider.name.clone(),
                    algo: meta.provider.algo,
                    priority_group: group,
                    weight: meta.weight.unwrap_or_else(|| meta.template.weight()),
                    kind: meta.template.kind,
                    template: meta.template.clone(),
                    aggregates_up_to: Some(aggregated),
                });
            }
        }

        let mut steps: Vec<ResolvedStep> = slots.into_iter().flatten().collect();
        let mut seen = HashSet::new();
        for step in &steps {
            if step.priority_group == 0 || step.weight == 0 {
                return Err(AutoMlError::InvalidArgument(format!(
                    "modeling step '{}' needs a priority group of at least 1 and a positive weight \
                     (got group {}, weight {})",
                    step.global_id(),
                    step.priority_group,
                    step.weight
                )));
            }
            if !seen.insert((step.provider.as_str(), step.id.as_str())) {
                return Err(AutoMlError::IllegalState(format!(
                    "modeling step '{}' resolved more than once",
                    step.global_id()
                )));
            }
        }
        steps.sort_by_key(|s| s.priority_group);
        for step in &steps {
            self.events
                .debug(Stage::Planning, format!("Resolved modeling step {step}"));
        }
        Ok(steps)
    }

    #[allow(clippy::type_complexity)]
    fn select<'c>(
        &self,
        provider: &'c ProviderCatalog,
        selector: &Selector,
    ) -> Vec<(&'c StepTemplate, Option<u32>, Option<u32>, Option<u32>)> {
        match selector {
            Selector::Alias(alias) => provider
                .steps
                .iter()
                .filter(|t| match alias {
                    Alias::All => true,
                    Alias::Defaults => t.is_default(),
                    Alias::Grids => t.is_grid(),
                })
                .map(|t| (t, None, None, None))
                .collect(),
            Selector::Ids(ids) => ids
                .iter()
                .filter_map(|id| self.lookup(provider, id))
                .map(|(t, instance)| (t, None, None, instance))
                .collect(),
            Selector::Steps(steps) => steps
                .iter()
                .filter_map(|s| {
                    self.lookup(provider, &s.id)
                        .map(|(t, instance)| (t, s.group, s.weight, instance))
                })
                .collect(),
        }
    }

    fn lookup<'c>(
        &self,
        provider: &'c ProviderCatalog,
        id: &str,
    ) -> Option<(&'c StepTemplate, Option<u32>)> {
        if let Some(template) = provider.template(id) {
            return Some((template, None));
        }
        if let Some(found) = meta_instance(provider, id) {
            return Some(found);
        }
        self.events.warn(
            Stage::Planning,
            format!(
                "Step '{id}' not defined in provider '{}': skipping it.",
                provider.name
            ),
        );
        None
    }
}

/// Matches `<meta template id>_<group>`.
fn meta_instance<'c>(provider: &'c ProviderCatalog, id: &str) -> Option<(&'c StepTemplate, Option<u32>)> {
    let (name, group) = id.rsplit_once('_')?;
    let group: u32 = group.parse().ok()?;
    provider
        .steps
        .iter()
        .find(|t| t.is_meta() && t.id == name)
        .map(|t| (t, Some(group)))
}

fn resolve_template(
    provider: &ProviderCatalog,
    template: &StepTemplate,
    group: Option<u32>,
    weight: Option<u32>,
) -> ResolvedStep {
    ResolvedStep {
        id: template.id.clone(),
        provider: provider.name.clone(),
        algo: provider.algo,
        priority_group: group.unwrap_or_else(|| template.group()),
        weight: weight.unwrap_or_else(|| template.weight()),
        kind: template.kind,
        template: template.clone(),
        aggregates_up_to: None,
    }
}

const DEFAULT_PROVIDERS: [&str; 7] = [
    "GLM",
    "DRF",
    "GBM",
    "XGBoost",
    "DeepLearning",
    "StackedEnsemble",
    "completion",
];

/// Every builtin step, including time-dependent dynamic steps.
pub fn default_plan() -> Vec<StepRequest> {
    DEFAULT_PROVIDERS
        .iter()
        .map(|name| StepRequest::alias(*name, Alias::All))
        .collect()
}

/// The default plan without dynamic steps, whose outcome depends on timing.
pub fn reproducible_plan() -> Vec<StepRequest> {
    DEFAULT_PROVIDERS
        .iter()
        .filter(|name| **name != "completion")
        .map(|name| StepRequest::alias(*name, Alias::All))
        .collect()
}

/// Rebuilds explicit requests from the steps that actually ran, so that a
/// run can be replayed with the same groups and weights.
pub fn definition_plan<'s>(steps: impl IntoIterator<Item = &'s ResolvedStep>) -> Vec<StepRequest> {
    let mut plan: Vec<StepRequest> = Vec::new();
    for step in steps {
        let entry = StepOverride::new(&step.id)
            .with_group(step.priority_group)
            .with_weight(step.weight);
        match plan.iter_mut().find(|r| r.name == step.provider) {
            Some(StepRequest {
                selector: Selector::Steps(list),
                ..
            }) => list.push(entry),
            _ => plan.push(StepRequest::steps(&step.provider, vec![entry])),
        }
    }
    plan
}

#[derive(Deserialize)]
struct PlanFile {
    plan: Vec<StepRequest>,
}

/// Reads a modeling plan: a JSON array of requests, or a TOML document
/// with `[[plan]]` tables.
pub fn load_plan(path: &Path) -> Result<Vec<StepRequest>> {
    let contents = std::fs::read_to_string(path)?;
    parse_plan(&contents, path.extension().and_then(|e| e.to_str()))
}

pub fn parse_plan(contents: &str, extension: Option<&str>) -> Result<Vec<StepRequest>> {
    match extension {
        Some(ext) if ext.eq_ignore_ascii_case("json") => Ok(serde_json::from_str(contents)?),
        Some(ext) if ext.eq_ignore_ascii_case("toml") => {
            Ok(toml::from_str::<PlanFile>(contents)?.plan)
        }
        other => Err(AutoMlError::InvalidArgument(format!(
            "unsupported plan file format: {}",
            other.unwrap_or("<none>")
        ))),
    }
}
