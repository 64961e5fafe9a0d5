//! Logging configuration and the lifecycle events shared by the binaries.

use std::env;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_target: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum LoggingInitError {
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub fn logging_config_from_env() -> LoggingConfig {
    let mut config = LoggingConfig::default();

    if let Ok(level) = env::var("ADVISOR_LOG_LEVEL") {
        let trimmed = level.trim();
        if !trimmed.is_empty() {
            config.level = trimmed.to_string();
        }
    }

    if let Some(parsed) = env::var("ADVISOR_LOG_FORMAT")
        .ok()
        .and_then(|raw| parse_log_format(&raw))
    {
        config.format = parsed;
    }

    if let Some(parsed) = env::var("ADVISOR_LOG_TARGET")
        .ok()
        .and_then(|raw| parse_bool(&raw))
    {
        config.include_target = parsed;
    }

    config
}

pub fn init_logging(config: &LoggingConfig) -> Result<(), LoggingInitError> {
    let env_filter =
        EnvFilter::try_new(config.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(config.include_target)
        .with_ansi(matches!(config.format, LogFormat::Pretty));

    match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.pretty().finish())?,
    }

    Ok(())
}

pub fn log_app_start(component: &'static str, logging: &LoggingConfig, pipeline: &PipelineConfig) {
    info!(
        component,
        event = "app.start",
        log_level = %logging.level,
        log_format = ?logging.format,
        include_target = logging.include_target,
        data_dir = %pipeline.data_dir.display(),
        index_name = %pipeline.index_name,
        n_lags = pipeline.n_lags,
        train_ratio = pipeline.train_ratio,
        length_of_data = %pipeline.length_of_data
    );
}

pub fn log_app_bind(bound_addr: SocketAddr) {
    info!(
        component = "advice_server",
        event = "app.bind",
        bind_addr = %bound_addr,
        routes = "/advice,/monitoring,/monitoring/reports"
    );
}

pub fn log_flow_step(flow: &'static str, step: &'static str, status: &'static str) {
    info!(
        component = "pipeline",
        event = "flow.step",
        flow,
        step,
        status
    );
}

fn parse_log_format(raw: &str) -> Option<LogFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" => Some(LogFormat::Pretty),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
