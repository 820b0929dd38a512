mod cli;
mod ui;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use automl_steps::automl::AutoML;
use automl_steps::config::AutoMlConfig;
use automl_steps::trainer::SimulatedTrainer;
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => AutoMlConfig::load_from(path)?,
        None => AutoMlConfig::load()?,
    };
    cli.apply(&mut config)?;

    let trainer = Arc::new(SimulatedTrainer::new(config.effective_sort_metric()));
    let automl = AutoML::new(config, trainer).context("invalid configuration")?;

    match cli.command {
        Command::Catalog => ui::print_catalog(automl.catalog()),
        Command::Plan { .. } => {
            let plan = automl.plan().context("planning the run")?;
            ui::print_plan(&plan);
        }
        Command::Run { json, .. } => {
            let progress = Arc::new(ui::RunProgress::start(automl.run_id()));
            let interrupt = {
                let progress = Arc::clone(&progress);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        progress.stop();
                    }
                })
            };
            let result = automl.run(progress.clone()).await;
            interrupt.abort();

            match result {
                Ok(report) => {
                    progress.finish(&report);
                    if !json {
                        ui::print_leaderboard(&report);
                    }
                    ui::print_report(&report);
                }
                Err(e) => {
                    progress.fail(&e.to_string());
                    return Err(e).context("run aborted");
                }
            }
        }
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "automl_steps=debug"
    } else {
        "automl_steps=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
