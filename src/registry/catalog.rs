//! Declared steps per provider.

use serde::{Deserialize, Serialize};

use crate::error::{AutoMlError, Result};
use crate::selection::StrategySpec;
use crate::work::{Algo, JobType};

pub const DEFAULT_MODEL_WEIGHT: u32 = 10;
pub const DEFAULT_MODEL_GROUP: u32 = 1;
pub const DEFAULT_GRID_WEIGHT: u32 = 30;
pub const DEFAULT_GRID_GROUP: u32 = 2;
pub const DEFAULT_SELECTION_WEIGHT: u32 = 20;
pub const DEFAULT_SELECTION_GROUP: u32 = 3;
pub const DEFAULT_DYNAMIC_WEIGHT: u32 = 20;
pub const DEFAULT_DYNAMIC_GROUP: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Model,
    Grid,
    Selection,
    Dynamic,
}

impl StepKind {
    pub fn default_group(&self) -> u32 {
        match self {
            StepKind::Model => DEFAULT_MODEL_GROUP,
            StepKind::Grid => DEFAULT_GRID_GROUP,
            StepKind::Selection => DEFAULT_SELECTION_GROUP,
            StepKind::Dynamic => DEFAULT_DYNAMIC_GROUP,
        }
    }

    pub fn default_weight(&self) -> u32 {
        match self {
            StepKind::Model => DEFAULT_MODEL_WEIGHT,
            StepKind::Grid => DEFAULT_GRID_WEIGHT,
            StepKind::Selection => DEFAULT_SELECTION_WEIGHT,
            StepKind::Dynamic => DEFAULT_DYNAMIC_WEIGHT,
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            StepKind::Model => JobType::ModelBuild,
            StepKind::Grid => JobType::HyperparamSearch,
            StepKind::Selection => JobType::Selection,
            StepKind::Dynamic => JobType::Dynamic,
        }
    }
}

/// Run-level limits a step may be exempt from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    ModelCount,
    Timeout,
    FailureCount,
}

/// Which leaderboard candidates a meta step aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaBase {
    /// The best candidate of every algorithm family.
    BestOfFamily,
    All,
    /// Every candidate trained under monotonicity constraints.
    Monotonic,
}

/// Groups a generic meta request expands into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaGroups {
    Every,
    Last,
    Listed(Vec<u32>),
}

impl MetaGroups {
    /// Picks the instance groups out of the ascending, deduplicated `present` groups.
    pub fn select(&self, present: &[u32]) -> Vec<u32> {
        match self {
            MetaGroups::Every => present.to_vec(),
            MetaGroups::Last => present.last().copied().into_iter().collect(),
            MetaGroups::Listed(groups) => present
                .iter()
                .copied()
                .filter(|g| groups.contains(g))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTemplate {
    pub base: MetaBase,
    pub groups: MetaGroups,
}

/// One declared step of a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: String,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    /// Member of the `defaults` alias. Unset means "plain model steps only".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<MetaTemplate>,
    /// Selection steps only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategySpec>,
    /// Grid steps: models built when no model budget applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_size: Option<usize>,
    /// Dynamic steps: how many earlier searches to resume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sub_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore: Vec<Constraint>,
}

impl StepTemplate {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            group: None,
            weight: None,
            default: None,
            meta: None,
            strategy: None,
            search_size: None,
            max_sub_steps: None,
            ignore: Vec::new(),
        }
    }

    pub fn model(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Model)
    }

    pub fn grid(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Grid)
    }

    pub fn selection(id: impl Into<String>, strategy: StrategySpec) -> Self {
        let mut t = Self::new(id, StepKind::Selection);
        t.strategy = Some(strategy);
        t
    }

    pub fn dynamic(id: impl Into<String>) -> Self {
        Self::new(id, StepKind::Dynamic)
    }

    pub fn meta(id: impl Into<String>, base: MetaBase, groups: MetaGroups) -> Self {
        let mut t = Self::new(id, StepKind::Model);
        t.meta = Some(MetaTemplate { base, groups });
        t.default = Some(true);
        t.ignore = vec![Constraint::ModelCount, Constraint::FailureCount];
        t
    }

    pub fn in_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    pub fn weighted(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_search_size(mut self, size: usize) -> Self {
        self.search_size = Some(size);
        self
    }

    pub fn ignoring(mut self, constraint: Constraint) -> Self {
        if !self.ignore.contains(&constraint) {
            self.ignore.push(constraint);
        }
        self
    }

    pub fn group(&self) -> u32 {
        self.group.unwrap_or_else(|| self.kind.default_group())
    }

    pub fn weight(&self) -> u32 {
        self.weight.unwrap_or_else(|| self.kind.default_weight())
    }

    pub fn is_default(&self) -> bool {
        self.default
            .unwrap_or(self.kind == StepKind::Model && self.meta.is_none())
    }

    pub fn is_grid(&self) -> bool {
        self.kind == StepKind::Grid
    }

    pub fn is_meta(&self) -> bool {
        self.meta.is_some()
    }

    pub fn ignores(&self, constraint: Constraint) -> bool {
        self.ignore.contains(&constraint)
    }
}

/// The ordered step declarations of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCatalog {
    pub name: String,
    pub algo: Algo,
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl ProviderCatalog {
    pub fn new(name: impl Into<String>, algo: Algo, steps: Vec<StepTemplate>) -> Self {
        Self {
            name: name.into(),
            algo,
            steps,
        }
    }

    pub fn template(&self, id: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|t| t.id == id)
    }
}

/// All known providers. Built once and passed by reference to resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCatalog {
    providers: Vec<ProviderCatalog>,
}

impl StepCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        use crate::selection::StrategySpec::KeepBestN;

        let providers = vec![
            ProviderCatalog::new("GLM", Algo::Glm, vec![StepTemplate::model("def_1")]),
            ProviderCatalog::new(
                "DRF",
                Algo::Drf,
                vec![
                    StepTemplate::model("def_1"),
                    StepTemplate::model("XRT").in_group(3),
                ],
            ),
            ProviderCatalog::new(
                "GBM",
                Algo::Gbm,
                vec![
                    StepTemplate::model("def_1"),
                    StepTemplate::model("def_2").in_group(2),
                    StepTemplate::model("def_3").in_group(2),
                    StepTemplate::model("def_4").in_group(2),
                    StepTemplate::model("def_5").in_group(3),
                    StepTemplate::grid("grid_1").in_group(4).weighted(60),
                    StepTemplate::selection(
                        "lr_annealing",
                        KeepBestN { n: 1 },
                    )
                    .in_group(6)
                    .weighted(DEFAULT_MODEL_WEIGHT),
                ],
            ),
            ProviderCatalog::new(
                "XGBoost",
                Algo::XGBoost,
                vec![
                    StepTemplate::model("def_1").in_group(2),
                    StepTemplate::model("def_2").in_group(2),
                    StepTemplate::model("def_3").in_group(3),
                    StepTemplate::grid("grid_1").in_group(4).weighted(150),
                    StepTemplate::selection(
                        "lr_search",
                        KeepBestN { n: 1 },
                    )
                    .in_group(6)
                    .weighted(2 * DEFAULT_GRID_WEIGHT),
                ],
            ),
            ProviderCatalog::new(
                "DeepLearning",
                Algo::DeepLearning,
                vec![
                    StepTemplate::model("def_1").in_group(3),
                    StepTemplate::grid("grid_1").in_group(4),
                    StepTemplate::grid("grid_2").in_group(5),
                    StepTemplate::grid("grid_3").in_group(5),
                ],
            ),
            ProviderCatalog::new(
                "StackedEnsemble",
                Algo::StackedEnsemble,
                vec![
                    StepTemplate::meta("best_of_family", MetaBase::BestOfFamily, MetaGroups::Every),
                    StepTemplate::meta("all", MetaBase::All, MetaGroups::Last),
                    {
                        let mut monotonic =
                            StepTemplate::meta("monotonic", MetaBase::Monotonic, MetaGroups::Last);
                        monotonic.default = Some(false);
                        monotonic
                    },
                ],
            ),
            ProviderCatalog::new("completion", Algo::Virtual, {
                let mut resume = StepTemplate::dynamic("resume_best_grids").weighted(60);
                resume.max_sub_steps = Some(2);
                vec![resume]
            }),
        ];
        Self { providers }
    }

    pub fn providers(&self) -> &[ProviderCatalog] {
        &self.providers
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderCatalog> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Adds a provider, or appends steps to an existing one.
    ///
    /// Fails on a step id already declared by that provider, or on an
    /// algorithm mismatch with the existing declaration.
    pub fn register(&mut self, provider: ProviderCatalog) -> Result<()> {
        let Some(existing) = self.providers.iter_mut().find(|p| p.name == provider.name) else {
            ensure_unique_ids(&provider)?;
            self.providers.push(provider);
            return Ok(());
        };
        if existing.algo != provider.algo {
            return Err(AutoMlError::InvalidArgument(format!(
                "provider '{}' is declared for {}, not {}",
                existing.name, existing.algo, provider.algo
            )));
        }
        for step in provider.steps {
            if existing.template(&step.id).is_some() {
                return Err(AutoMlError::InvalidArgument(format!(
                    "step '{}' is already declared by provider '{}'",
                    step.id, existing.name
                )));
            }
            existing.steps.push(step);
        }
        Ok(())
    }

    pub fn with_providers(mut self, providers: impl IntoIterator<Item = ProviderCatalog>) -> Result<Self> {
        for provider in providers {
            self.register(provider)?;
        }
        Ok(self)
    }
}

fn ensure_unique_ids(provider: &ProviderCatalog) -> Result<()> {
    for (i, step) in provider.steps.iter().enumerate() {
        if provider.steps[..i].iter().any(|s| s.id == step.id) {
            return Err(AutoMlError::InvalidArgument(format!(
                "step '{}' is declared twice by provider '{}'",
                step.id, provider.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_declares_known_providers() {
        let catalog = StepCatalog::builtin();
        let names: Vec<_> = catalog.providers().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["GLM", "DRF", "GBM", "XGBoost", "DeepLearning", "StackedEnsemble", "completion"]
        );
        let gbm = catalog.provider("GBM").unwrap();
        assert_eq!(gbm.template("def_1").unwrap().group(), 1);
        assert_eq!(gbm.template("grid_1").unwrap().weight(), 60);
        let monotonic = catalog.provider("StackedEnsemble").unwrap().template("monotonic").unwrap();
        assert!(monotonic.is_meta());
        assert!(!monotonic.is_default());
    }

    #[test]
    fn kind_defaults() {
        let t = StepTemplate::grid("g");
        assert_eq!(t.group(), DEFAULT_GRID_GROUP);
        assert_eq!(t.weight(), DEFAULT_GRID_WEIGHT);
        assert!(!t.is_default());
        assert!(t.is_grid());
        let d = StepTemplate::dynamic("d");
        assert_eq!(d.kind.job_type(), JobType::Dynamic);
        assert_eq!(d.group(), 100);
        assert!(StepTemplate::model("m").is_default());
    }

    #[test]
    fn meta_templates_are_defaults_exempt_from_model_count() {
        let t = StepTemplate::meta("all", MetaBase::All, MetaGroups::Last);
        assert!(t.is_meta());
        assert!(t.is_default());
        assert!(t.ignores(Constraint::ModelCount));
        assert!(!t.ignores(Constraint::Timeout));
    }

    #[test]
    fn meta_group_policies() {
        let present = [1, 2, 4];
        assert_eq!(MetaGroups::Every.select(&present), vec![1, 2, 4]);
        assert_eq!(MetaGroups::Last.select(&present), vec![4]);
        assert_eq!(MetaGroups::Listed(vec![2, 3]).select(&present), vec![2]);
        assert!(MetaGroups::Last.select(&[]).is_empty());
    }

    #[test]
    fn register_extends_existing_provider() {
        let mut catalog = StepCatalog::builtin();
        catalog
            .register(ProviderCatalog::new(
                "GLM",
                Algo::Glm,
                vec![StepTemplate::grid("grid_1")],
            ))
            .unwrap();
        assert!(catalog.provider("GLM").unwrap().template("grid_1").is_some());

        let dup = catalog.register(ProviderCatalog::new(
            "GLM",
            Algo::Glm,
            vec![StepTemplate::model("def_1")],
        ));
        assert!(matches!(dup, Err(AutoMlError::InvalidArgument(_))));

        let mismatch = catalog.register(ProviderCatalog::new("GLM", Algo::Drf, vec![]));
        assert!(matches!(mismatch, Err(AutoMlError::InvalidArgument(_))));
    }

    #[test]
    fn provider_tables_deserialize_from_toml() {
        #[derive(Deserialize)]
        struct Doc {
            providers: Vec<ProviderCatalog>,
        }
        let doc: Doc = toml::from_str(
            r#"
            [[providers]]
            name = "MyGBM"
            algo = "GBM"

            [[providers.steps]]
            id = "deep"
            kind = "model"
            group = 2
            weight = 15

            [[providers.steps]]
            id = "select"
            kind = "selection"
            strategy = { type = "keep_best_n", n = 3 }
            "#,
        )
        .unwrap();
        let p = &doc.providers[0];
        assert_eq!(p.algo, Algo::Gbm);
        assert_eq!(p.steps[0].group(), 2);
        assert_eq!(p.steps[1].strategy, Some(StrategySpec::KeepBestN { n: 3 }));
        let catalog = StepCatalog::new().with_providers(doc.providers).unwrap();
        assert!(catalog.provider("MyGBM").is_some());
    }
}
