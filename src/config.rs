//! Pipeline configuration, passed explicitly into every flow step.

use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market_data::{parse_length_of_data, RetryPolicy};

pub const DEFAULT_INDEX_NAME: &str = "BEL_20";
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:9696";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub tracking_uri: String,
    pub workspace_name: String,
    pub n_lags: usize,
    pub train_ratio: f64,
    pub length_of_data: String,
    pub max_lags_used: usize,
    pub index_name: String,
    pub fetch_retry: RetryPolicy,
    pub http_timeout_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            tracking_uri: default_tracking_uri(&data_dir),
            workspace_name: default_workspace_name(&data_dir),
            data_dir,
            n_lags: 10,
            train_ratio: 0.8,
            length_of_data: "60d".to_string(),
            max_lags_used: 10,
            index_name: DEFAULT_INDEX_NAME.to_string(),
            fetch_retry: RetryPolicy::default(),
            http_timeout_ms: 15_000,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidEnvValue { name: &'static str, value: String },
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_lags < 1 {
            return Err(ConfigError::Invalid("n_lags must be >= 1".to_string()));
        }
        if !(self.train_ratio > 0.0 && self.train_ratio < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "train_ratio must be in (0, 1), got {}",
                self.train_ratio
            )));
        }
        if self.max_lags_used < 1 || self.max_lags_used > self.n_lags {
            return Err(ConfigError::Invalid(format!(
                "max_lags_used must be in 1..={}, got {}",
                self.n_lags, self.max_lags_used
            )));
        }
        if self.fetch_retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "fetch max_attempts must be >= 1".to_string(),
            ));
        }
        if self.index_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "index_name must not be empty".to_string(),
            ));
        }
        parse_length_of_data(&self.length_of_data)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        Ok(())
    }

    pub fn tickers_path(&self) -> PathBuf {
        self.data_dir.join("tickers.csv")
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(format!("{}.csv", self.index_name))
    }

    pub fn reference_snapshot_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{}_reference.csv", self.index_name))
    }

    pub fn advice_path(&self) -> PathBuf {
        self.data_dir.join("advice.json")
    }

    pub fn registry_path(&self) -> PathBuf {
        let trimmed = self.tracking_uri.trim();
        PathBuf::from(trimmed.strip_prefix("sqlite:///").unwrap_or(trimmed))
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace_name)
    }
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    let mut config = PipelineConfig::default();

    if let Some(data_dir) = non_empty_var("ADVISOR_DATA_DIR") {
        config.data_dir = PathBuf::from(data_dir);
        config.tracking_uri = default_tracking_uri(&config.data_dir);
        config.workspace_name = default_workspace_name(&config.data_dir);
    }
    if let Some(tracking_uri) = non_empty_var("ADVISOR_TRACKING_URI") {
        config.tracking_uri = tracking_uri;
    }
    if let Some(workspace) = non_empty_var("ADVISOR_WORKSPACE") {
        config.workspace_name = workspace;
    }
    if let Some(length) = non_empty_var("ADVISOR_LENGTH_OF_DATA") {
        config.length_of_data = length;
    }
    if let Some(index_name) = non_empty_var("ADVISOR_INDEX_NAME") {
        config.index_name = index_name;
    }

    if let Some(n_lags) = parsed_var("ADVISOR_N_LAGS")? {
        config.n_lags = n_lags;
    }
    if let Some(train_ratio) = parsed_var("ADVISOR_TRAIN_RATIO")? {
        config.train_ratio = train_ratio;
    }
    if let Some(max_lags_used) = parsed_var("ADVISOR_MAX_LAGS_USED")? {
        config.max_lags_used = max_lags_used;
    }
    if let Some(max_attempts) = parsed_var("ADVISOR_FETCH_MAX_ATTEMPTS")? {
        config.fetch_retry.max_attempts = max_attempts;
    }
    if let Some(delay_ms) = parsed_var("ADVISOR_FETCH_RETRY_DELAY_MS")? {
        config.fetch_retry.delay_ms = delay_ms;
    }
    if let Some(timeout_ms) = parsed_var("ADVISOR_HTTP_TIMEOUT_MS")? {
        config.http_timeout_ms = timeout_ms;
    }

    config.validate()?;
    Ok(config)
}

pub fn server_addr_from_env() -> Result<SocketAddr, ConfigError> {
    let raw = non_empty_var("ADVISOR_SERVER_ADDR")
        .unwrap_or_else(|| DEFAULT_SERVER_ADDR.to_string());
    raw.parse().map_err(|_| ConfigError::InvalidEnvValue {
        name: "ADVISOR_SERVER_ADDR",
        value: raw,
    })
}

fn default_tracking_uri(data_dir: &Path) -> String {
    data_dir.join("registry.sqlite").display().to_string()
}

fn default_workspace_name(data_dir: &Path) -> String {
    data_dir.join("monitoring").display().to_string()
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parsed_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match non_empty_var(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvValue { name, value: raw }),
        None => Ok(None),
    }
}
