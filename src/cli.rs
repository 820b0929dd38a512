//! Interface de linha de comando do automl-steps baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (catalog, plan, run)
//! e flags globais que sobrescrevem a configuração carregada do arquivo.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use automl_steps::config::AutoMlConfig;
use automl_steps::registry::load_plan;

/// automl-steps: agendamento de steps e seleção de candidatos para AutoML.
#[derive(Debug, Parser)]
#[command(name = "automl-steps", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho para o arquivo de configuração (padrão: `automl.toml`).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Tempo máximo da execução em segundos.
    #[arg(long, global = true)]
    pub max_runtime_secs: Option<f64>,

    /// Número máximo de modelos treinados.
    #[arg(long, global = true)]
    pub max_models: Option<usize>,

    /// Quantos steps podem treinar ao mesmo tempo.
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// Semente para execuções reprodutíveis.
    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Lista os providers e seus steps.
    Catalog,

    /// Mostra o plano resolvido, com grupos e pesos.
    Plan {
        /// Caminho para um arquivo JSON ou TOML com o plano de modelagem.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Executa o plano com o treinador simulado.
    Run {
        /// Caminho para um arquivo JSON ou TOML com o plano de modelagem.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Imprime apenas o relatório JSON.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Cli {
    /// Aplica as flags da linha de comando sobre a configuração carregada.
    pub fn apply(&self, config: &mut AutoMlConfig) -> Result<()> {
        if let Some(secs) = self.max_runtime_secs {
            config.max_runtime_secs = secs;
        }
        if let Some(models) = self.max_models {
            config.max_models = models;
        }
        if let Some(parallelism) = self.parallelism {
            config.parallelism = parallelism;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        if let Command::Plan { file: Some(path) } | Command::Run { file: Some(path), .. } = &self.command {
            let plan = load_plan(path)
                .with_context(|| format!("loading modeling plan from {}", path.display()))?;
            config.modeling_plan = Some(plan);
        }
        Ok(())
    }
}
