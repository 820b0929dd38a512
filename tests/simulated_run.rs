use std::sync::Arc;
use std::time::Duration;

use automl_steps::automl::AutoML;
use automl_steps::config::AutoMlConfig;
use automl_steps::events::Level;
use automl_steps::executor::{Resolution, ResultStatus};
use automl_steps::progress::ParentJob;
use automl_steps::registry::parse_plan;
use automl_steps::trainer::SimulatedTrainer;

fn trainer(config: &AutoMlConfig) -> Arc<SimulatedTrainer> {
    Arc::new(
        SimulatedTrainer::new(config.effective_sort_metric())
            .with_model_delay(Duration::from_millis(1))
            .with_search_size(2),
    )
}

#[tokio::test]
async fn default_plan_runs_to_completion() {
    let config = AutoMlConfig {
        max_runtime_secs: 60.0,
        parallelism: 4,
        exploitation_ratio: 0.1,
        ..AutoMlConfig::default()
    };
    let aml = AutoML::new(config.clone(), trainer(&config)).unwrap();
    let parent = Arc::new(ParentJob::new("integration"));

    let report = aml.run(parent.clone()).await.unwrap();

    assert_eq!(parent.progress(), 1.0);
    assert_eq!(report.progress, 1.0);
    assert!(report.model_count > 0);
    assert!(!report.leaderboard.is_empty());
    let scores: Vec<f64> = report.leaderboard.iter().filter_map(|r| r.score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]), "auc ranks best-first");

    let resumed = report
        .steps
        .iter()
        .find(|s| s.id == "completion:resume_best_grids")
        .expect("resume step reported");
    assert!(resumed.is(ResultStatus::Success));
    assert!(!resumed.sub_states.is_empty());
    assert!(report.steps.iter().any(|s| s.id.starts_with("StackedEnsemble:all_")));
    assert!(aml.events().at_level(Level::Error).is_empty());
}

#[tokio::test]
async fn model_budget_is_respected_sequentially() {
    let config = AutoMlConfig {
        max_models: 6,
        parallelism: 1,
        resolution: Resolution::Pessimistic,
        ..AutoMlConfig::default()
    };
    let aml = AutoML::new(config.clone(), trainer(&config)).unwrap();
    let parent = Arc::new(ParentJob::new("budget"));

    let report = aml.run(parent.clone()).await.unwrap();

    assert!(report.model_count <= 6, "built {} models", report.model_count);
    assert_eq!(parent.progress(), 1.0);
    assert!(
        report
            .steps
            .iter()
            .any(|s| s.error.as_deref() == Some("hit the max_models limit"))
    );
}

#[tokio::test]
async fn actual_plan_replays_the_same_steps() {
    let plan = parse_plan(
        r#"
            [[plan]]
            name = "GLM"
            alias = "all"

            [[plan]]
            name = "GBM"
            ids = ["def_1", "def_2"]

            [[plan]]
            name = "StackedEnsemble"
            alias = "defaults"
        "#,
        Some("toml"),
    )
    .unwrap();
    let config = AutoMlConfig {
        max_runtime_secs: 30.0,
        modeling_plan: Some(plan),
        seed: Some(7),
        ..AutoMlConfig::default()
    };
    let first = AutoML::new(config.clone(), trainer(&config)).unwrap();
    let report = first.run(Arc::new(ParentJob::new("first"))).await.unwrap();

    let replay = AutoMlConfig {
        modeling_plan: Some(report.actual_plan.clone()),
        ..config.clone()
    };
    let second = AutoML::new(replay.clone(), trainer(&replay)).unwrap();
    let replayed: Vec<String> = second
        .plan()
        .unwrap()
        .steps
        .iter()
        .map(|s| s.global_id())
        .collect();
    let succeeded: Vec<String> = report
        .steps
        .iter()
        .filter(|s| s.is(ResultStatus::Success))
        .map(|s| s.id.clone())
        .collect();
    assert_eq!(replayed.len(), succeeded.len());
    assert!(succeeded.iter().all(|id| replayed.contains(id)));
}
