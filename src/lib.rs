//! Trading advisor core crate.
//!
//! Current implemented scope:
//! - lagged log-return features and the chronological train/test split
//! - Yahoo chart ingestion, CSV snapshots and the lag-count model sweep
//! - SQLite model registry, next-day advice and drift monitoring
//! - the `/advice` HTTP surface

mod advice;
mod config;
mod drift;
mod features;
mod market_data;
mod model;
mod observability;
mod pipeline;
mod registry;
mod server;
mod snapshot;

pub use advice::{
    assert_rows_compatible, make_advice, read_advice, write_advice, AdviceDocument, AdviceEntry,
    AdviceError, Direction,
};
pub use config::{
    pipeline_config_from_env, server_addr_from_env, ConfigError, PipelineConfig,
    DEFAULT_INDEX_NAME, DEFAULT_SERVER_ADDR,
};
pub use drift::{
    build_drift_report, ks_two_sample, list_reports_in, prepare_monitoring_frame, ColumnDrift,
    ColumnSummary, DashboardPanel, DriftError, DriftReport, KsTest, MonitoringFrame,
    MonitoringProject, MonitoringWorkspace, PanelKind, PanelMetric, DATASET_DRIFT_SHARE,
    DEFAULT_PROJECT_NAME, DRIFT_P_VALUE_THRESHOLD,
};
pub use features::{
    add_lag_features, chronological_split, compute_log_returns, lag_column_names,
    latest_feature_rows, train_cut, FeatureError, FeatureRow, Observation, Panel, SplitReport,
    SplitResult, LAG_COLUMN_PREFIX,
};
pub use market_data::{
    chart_url, fetch_panel, fetch_price_history, load_tickers, parse_chart_payload,
    parse_length_of_data, HttpFetcher, MarketDataError, PriceBar, ReqwestBlockingFetcher,
    RetryPolicy,
};
pub use model::{
    assert_schema_compatible, best_candidate, sweep_lag_counts, train_candidate,
    CandidateOutcome, LinearRegression, ModelError, Preprocessor, RegressionMetrics,
    TrainedModel,
};
pub use observability::{
    init_logging, log_app_bind, log_app_start, log_flow_step, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use pipeline::{
    experiment_name, load_production_model, model_name, run_monitoring_flow,
    run_prediction_flow, run_training_flow, PipelineError, TrainingSummary, MODEL_NAME_PREFIX,
};
pub use registry::{
    register_best_model, ModelRegistry, ModelVersion, RegistryError, RunRecord, Stage,
};
pub use server::{
    advice_router, render_monitoring_html, AdviceSource, FileAdviceSource, InMemoryAdviceSource,
    InMemoryReportSource, ReportSource, WorkspaceReportSource, MONITORING_HEADERS,
};
pub use snapshot::{
    ensure_reference_snapshot, read_panel_snapshot, write_panel_snapshot, SnapshotError,
};
