//! Training, prediction and monitoring flows wired from the modules above.

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::advice::{make_advice, write_advice, AdviceDocument, AdviceError};
use crate::config::{ConfigError, PipelineConfig};
use crate::drift::{
    build_drift_report, prepare_monitoring_frame, DriftError, DriftReport, MonitoringWorkspace,
    DEFAULT_PROJECT_NAME,
};
use crate::features::{
    add_lag_features, chronological_split, compute_log_returns, latest_feature_rows, FeatureError,
    SplitReport,
};
use crate::market_data::{fetch_panel, load_tickers, HttpFetcher, MarketDataError};
use crate::model::{best_candidate, sweep_lag_counts, ModelError, TrainedModel};
use crate::observability::log_flow_step;
use crate::registry::{register_best_model, ModelRegistry, ModelVersion, RegistryError, Stage};
use crate::snapshot::{
    ensure_reference_snapshot, read_panel_snapshot, write_panel_snapshot, SnapshotError,
};

pub const MODEL_NAME_PREFIX: &str = "best-model-";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Advice(#[from] AdviceError),
    #[error(transparent)]
    Drift(#[from] DriftError),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingSummary {
    pub experiment: String,
    pub candidates: usize,
    pub best_n_lags_used: usize,
    pub best_mape: f64,
    pub registered: ModelVersion,
    pub split: SplitReport,
}

pub fn experiment_name(index_name: &str, run_date: NaiveDate) -> String {
    format!(
        "stock-prediction-{}-{}",
        index_name.replace('_', "-"),
        run_date.format("%Y-%m-%d")
    )
}

pub fn model_name(run_date: NaiveDate) -> String {
    format!("{MODEL_NAME_PREFIX}{}", run_date.format("%Y-%m-%d"))
}

pub fn run_training_flow(
    cfg: &PipelineConfig,
    fetcher: &dyn HttpFetcher,
    run_date: NaiveDate,
) -> Result<TrainingSummary, PipelineError> {
    cfg.validate()?;

    log_flow_step("training", "fetch", "start");
    let tickers = load_tickers(&cfg.tickers_path())?;
    let raw = fetch_panel(fetcher, &tickers, &cfg.length_of_data, &cfg.fetch_retry)?;
    let panel = add_lag_features(&compute_log_returns(&raw), cfg.n_lags)?;
    write_panel_snapshot(&cfg.snapshot_path(), &panel)?;
    log_flow_step("training", "fetch", "finish");

    log_flow_step("training", "train", "start");
    let split = chronological_split(&panel, cfg.train_ratio)?;
    let outcomes = sweep_lag_counts(&split, cfg.max_lags_used)?;

    let experiment = experiment_name(&cfg.index_name, run_date);
    let mut registry = ModelRegistry::open(&cfg.registry_path())?;
    for outcome in &outcomes {
        registry.log_run(&experiment, outcome)?;
    }
    let best = best_candidate(&outcomes).ok_or(ModelError::NoViableCandidate)?;
    let (best_n_lags_used, best_mape) = (best.n_lags_used, best.metrics.mape);
    log_flow_step("training", "train", "finish");

    log_flow_step("training", "register", "start");
    let registered = register_best_model(&mut registry, &experiment, &model_name(run_date))?;
    log_flow_step("training", "register", "finish");

    let summary = TrainingSummary {
        experiment,
        candidates: outcomes.len(),
        best_n_lags_used,
        best_mape,
        registered,
        split: split.report,
    };
    info!(
        component = "pipeline",
        event = "pipeline.training.finish",
        experiment = %summary.experiment,
        candidates = summary.candidates,
        best_n_lags_used = summary.best_n_lags_used,
        best_mape = summary.best_mape,
        model = %summary.registered.name,
        version = summary.registered.version
    );
    Ok(summary)
}

/// Production model for `run_date`, or the newest Production model of an
/// earlier run when today's has not been trained yet.
pub fn load_production_model(
    registry: &ModelRegistry,
    run_date: NaiveDate,
) -> Result<(ModelVersion, TrainedModel), PipelineError> {
    let name = model_name(run_date);
    match registry.load_model(&name, Stage::Production) {
        Ok(found) => Ok(found),
        Err(RegistryError::NoModelInStage { .. }) => {
            warn!(
                component = "pipeline",
                event = "pipeline.model.fallback",
                requested = %name,
                prefix = MODEL_NAME_PREFIX
            );
            Ok(registry.latest_model_in_stage(MODEL_NAME_PREFIX, Stage::Production)?)
        }
        Err(err) => Err(err.into()),
    }
}

pub fn run_prediction_flow(
    cfg: &PipelineConfig,
    run_date: NaiveDate,
) -> Result<AdviceDocument, PipelineError> {
    cfg.validate()?;

    log_flow_step("prediction", "advise", "start");
    let panel = read_panel_snapshot(&cfg.snapshot_path())?;
    let rows = latest_feature_rows(&panel, cfg.n_lags)?;
    let registry = ModelRegistry::open(&cfg.registry_path())?;
    let (version, model) = load_production_model(&registry, run_date)?;
    info!(
        component = "pipeline",
        event = "pipeline.model.loaded",
        model = %version.name,
        version = version.version,
        n_lags_used = model.n_lags_used()
    );

    let document = make_advice(&model, &rows)?;
    write_advice(&cfg.advice_path(), &document)?;
    log_flow_step("prediction", "advise", "finish");
    Ok(document)
}

pub fn run_monitoring_flow(
    cfg: &PipelineConfig,
    run_date: NaiveDate,
) -> Result<DriftReport, PipelineError> {
    cfg.validate()?;

    log_flow_step("monitoring", "report", "start");
    let reference_path = cfg.reference_snapshot_path();
    ensure_reference_snapshot(&cfg.snapshot_path(), &reference_path)?;
    let reference = read_panel_snapshot(&reference_path)?;
    let current = read_panel_snapshot(&cfg.snapshot_path())?;

    let registry = ModelRegistry::open(&cfg.registry_path())?;
    let (_, model) = load_production_model(&registry, run_date)?;

    let reference_frame = prepare_monitoring_frame(&reference, &model)?;
    let current_frame = prepare_monitoring_frame(&current, &model)?;
    let report = build_drift_report(&reference_frame, &current_frame)?;

    let workspace =
        MonitoringWorkspace::open_or_create(&cfg.workspace_path(), DEFAULT_PROJECT_NAME)?;
    workspace.add_report(&report)?;
    log_flow_step("monitoring", "report", "finish");
    Ok(report)
}
