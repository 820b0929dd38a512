//! Interface de terminal do automl-steps: barra de progresso e saída colorida.
//!
//! Usa as crates `indicatif` para a barra de progresso e `console` para
//! estilização com cores. O [`RunProgress`] recebe o progresso da execução
//! e o exibe no terminal.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use automl_steps::automl::{Plan, RunReport};
use automl_steps::executor::ResultStatus;
use automl_steps::progress::{ParentJob, ProgressSink};
use automl_steps::registry::StepCatalog;

// Resolução da barra: progresso em milésimos.
const BAR_LENGTH: u64 = 1000;

/// Indicador visual de progresso de uma execução no terminal.
///
/// Acumula o progresso num [`ParentJob`] e espelha o valor na barra.
pub struct RunProgress {
    // Barra de progresso do indicatif.
    pb: ProgressBar,
    // Job pai que acumula o progresso e carrega o pedido de parada.
    job: ParentJob,
    green: Style,
    red: Style,
}

impl RunProgress {
    /// Inicia a barra com o nome da execução.
    pub fn start(name: &str) -> Self {
        let pb = ProgressBar::new(BAR_LENGTH);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}",
        ) {
            pb.set_style(style.progress_chars("=> "));
        }
        pb.set_message(format!("AutoML {name}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            job: ParentJob::new(name),
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
        }
    }

    /// Pede que nenhum step novo seja iniciado.
    pub fn stop(&self) {
        self.pb.println(format!(
            "  {} Stop requested: running steps will finish",
            Style::new().yellow().apply_to("!")
        ));
        self.job.stop();
    }

    /// Finaliza a barra e exibe o resumo da execução.
    pub fn finish(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        let failed = report
            .steps
            .iter()
            .filter(|s| s.is(ResultStatus::Failed))
            .count();
        println!(
            "  {} Run {} finished: {} models, {} steps, {} failed, progress {:.0}%",
            self.green.apply_to("✓"),
            report.run_id,
            report.model_count,
            report.steps.len(),
            failed,
            self.job.progress() * 100.0
        );
    }

    /// Finaliza a barra com uma mensagem de falha.
    pub fn fail(&self, reason: &str) {
        self.pb.abandon();
        println!("  {} Run failed: {reason}", self.red.apply_to("✗"));
    }
}

impl ProgressSink for RunProgress {
    fn advance(&self, fraction: f64) {
        self.job.advance(fraction);
        let position = (self.job.progress() * BAR_LENGTH as f64).round() as u64;
        self.pb.set_position(position.min(BAR_LENGTH));
    }

    fn message(&self, msg: &str) {
        self.job.message(msg);
        self.pb.set_message(msg.to_string());
    }

    fn stop_requested(&self) -> bool {
        self.job.stop_requested()
    }
}

/// Lista os providers do catálogo e seus steps.
pub fn print_catalog(catalog: &StepCatalog) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for provider in catalog.providers() {
        println!("{} ({})", bold.apply_to(&provider.name), provider.algo);
        for step in &provider.steps {
            println!(
                "  {:<20} {:<10} {}",
                step.id,
                format!("{:?}", step.kind),
                dim.apply_to(format!("group {} weight {}", step.group(), step.weight()))
            );
        }
    }
}

/// Imprime o plano resolvido, grupo a grupo.
pub fn print_plan(plan: &Plan) {
    let cyan = Style::new().cyan().bold();
    let mut group = None;
    for step in &plan.steps {
        if group != Some(step.priority_group) {
            group = Some(step.priority_group);
            println!("{}", cyan.apply_to(format!("── group {} ──", step.priority_group)));
        }
        let weight = plan
            .ledger
            .get(&step.id, &step.provider)
            .map_or(0, |w| w.weight());
        println!("  {:<40} {:?} weight {weight}", step.global_id(), step.kind);
    }
    println!("total work: {}", plan.ledger.remaining_work(None));
}

/// Imprime o leaderboard final com o líder destacado.
pub fn print_leaderboard(report: &RunReport) {
    let header = Style::new().bold().underlined();
    let green = Style::new().green();
    println!();
    println!(
        "{}",
        header.apply_to(format!(
            "{:>4}  {:<48} {:<16} {:>12}",
            "rank", "model", "algo", report.sort_metric.name
        ))
    );
    for row in &report.leaderboard {
        let score = row.score.map_or_else(|| "-".to_string(), |s| format!("{s:.6}"));
        let line = format!("{:>4}  {:<48} {:<16} {:>12}", row.rank + 1, row.id, row.algo, score);
        if row.rank == 0 {
            println!("{}", green.apply_to(line));
        } else {
            println!("{line}");
        }
    }
    if !report.evictions.is_empty() {
        println!("evicted: {}", report.evictions.join(", "));
    }
}

/// Imprime o relatório da execução formatado em JSON.
pub fn print_report(report: &RunReport) {
    println!();
    println!("{}", Style::new().cyan().apply_to("─── Run Report ───"));
    println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
}
