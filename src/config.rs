//! Configuração de uma execução AutoML carregada a partir de `automl.toml`.
//!
//! A struct [`AutoMlConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `AUTOML_MAX_RUNTIME_SECS` e `AUTOML_MAX_MODELS`
//! têm precedência sobre o arquivo; flags da CLI têm precedência sobre ambas.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::Resolution;
use crate::leaderboard::{Direction, PolarityTable, SortMetric, Task, default_metric_for};
use crate::registry::{ProviderCatalog, StepRequest};
use crate::work::Algo;

/// Nome do arquivo de configuração procurado no diretório atual.
pub const CONFIG_FILE: &str = "automl.toml";

/// Configuração de nível superior carregada de `automl.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoMlConfig {
    /// Tempo máximo da execução em segundos. Zero significa sem limite.
    #[serde(default)]
    pub max_runtime_secs: f64,

    /// Número máximo de modelos (fora ensembles). Zero significa sem limite.
    #[serde(default)]
    pub max_models: usize,

    /// Quantos steps podem treinar ao mesmo tempo.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Fração do orçamento dedicada à fase de exploração fina.
    /// Valores negativos desativam a redistribuição.
    #[serde(default = "default_exploitation_ratio")]
    pub exploitation_ratio: f64,

    /// Falhas consecutivas toleradas antes de abortar a execução.
    #[serde(default = "default_max_consecutive_model_failures")]
    pub max_consecutive_model_failures: usize,

    /// Métrica de ordenação do leaderboard. Sem valor, depende de `task`.
    #[serde(default)]
    pub sort_metric: Option<String>,

    #[serde(default = "default_task")]
    pub task: Task,

    /// Como os resultados de sub-steps são combinados.
    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub exclude_algos: Option<Vec<Algo>>,

    #[serde(default)]
    pub include_algos: Option<Vec<Algo>>,

    /// Sobrescritas da direção de métricas (`"descending"` = maior é melhor).
    #[serde(default)]
    pub polarity: BTreeMap<String, Direction>,

    /// Plano de modelagem explícito. Sem valor, usa o plano padrão.
    #[serde(default)]
    pub modeling_plan: Option<Vec<StepRequest>>,

    /// Providers adicionais registrados no catálogo embutido.
    #[serde(default)]
    pub providers: Vec<ProviderCatalog>,

    /// Semente para treinos reprodutíveis.
    #[serde(default)]
    pub seed: Option<u64>,
}

// Valor padrão para o paralelismo: 1 step por vez.
fn default_parallelism() -> usize {
    1
}

// Valor padrão para a razão de exploração fina: desativada.
fn default_exploitation_ratio() -> f64 {
    -1.0
}

// Valor padrão para falhas consecutivas: 10.
fn default_max_consecutive_model_failures() -> usize {
    10
}

// Valor padrão para a tarefa: classificação binária.
fn default_task() -> Task {
    Task::Binomial
}

impl Default for AutoMlConfig {
    fn default() -> Self {
        Self {
            max_runtime_secs: 0.0,
            max_models: 0,
            parallelism: default_parallelism(),
            exploitation_ratio: default_exploitation_ratio(),
            max_consecutive_model_failures: default_max_consecutive_model_failures(),
            sort_metric: None,
            task: default_task(),
            resolution: Resolution::default(),
            exclude_algos: None,
            include_algos: None,
            polarity: BTreeMap::new(),
            modeling_plan: None,
            providers: Vec::new(),
            seed: None,
        }
    }
}

impl AutoMlConfig {
    /// Carrega a configuração de `automl.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de `path` e aplica as variáveis de ambiente.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<AutoMlConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Aplica sobrescritas vindas de variáveis de ambiente.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(secs) = lookup("AUTOML_MAX_RUNTIME_SECS")
            && !secs.is_empty()
        {
            self.max_runtime_secs = secs
                .parse()
                .with_context(|| format!("AUTOML_MAX_RUNTIME_SECS is not a number: {secs}"))?;
        }
        if let Some(models) = lookup("AUTOML_MAX_MODELS")
            && !models.is_empty()
        {
            self.max_models = models
                .parse()
                .with_context(|| format!("AUTOML_MAX_MODELS is not a count: {models}"))?;
        }
        Ok(())
    }

    /// Tabela de polaridade embutida com as sobrescritas do arquivo.
    pub fn polarity_table(&self) -> PolarityTable {
        self.polarity
            .iter()
            .fold(PolarityTable::default(), |table, (metric, direction)| {
                table.with(metric, *direction)
            })
    }

    /// Métrica de ordenação efetiva, com a direção resolvida.
    pub fn effective_sort_metric(&self) -> SortMetric {
        let name = self
            .sort_metric
            .as_deref()
            .filter(|m| !m.eq_ignore_ascii_case("auto"))
            .unwrap_or_else(|| default_metric_for(self.task));
        self.polarity_table().sort_metric(name)
    }
}
