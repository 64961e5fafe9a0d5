//! Per-entity log returns, lag features and the chronological train/test split.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const LAG_COLUMN_PREFIX: &str = "lag_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub entity_id: String,
    pub date: NaiveDate,
    pub close_price: f64,
    pub log_return: Option<f64>,
    /// `lags[i - 1]` holds `lag_i`.
    pub lags: Vec<Option<f64>>,
}

impl Observation {
    pub fn new(entity_id: impl Into<String>, date: NaiveDate, close_price: f64) -> Self {
        Self {
            entity_id: entity_id.into(),
            date,
            close_price,
            log_return: None,
            lags: Vec::new(),
        }
    }

    /// 1-based lag accessor; `lag(0)` and out-of-range lags are missing.
    pub fn lag(&self, i: usize) -> Option<f64> {
        i.checked_sub(1)
            .and_then(|idx| self.lags.get(idx).copied().flatten())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Panel {
    pub observations: Vec<Observation>,
}

impl Panel {
    pub fn new(observations: Vec<Observation>) -> Self {
        Self { observations }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn n_lags(&self) -> usize {
        self.observations
            .iter()
            .map(|obs| obs.lags.len())
            .max()
            .unwrap_or(0)
    }

    pub fn entities(&self) -> Vec<String> {
        entity_sequences(&self.observations)
            .into_keys()
            .map(str::to_string)
            .collect()
    }

    pub fn latest_date(&self) -> Option<NaiveDate> {
        self.observations.iter().map(|obs| obs.date).max()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub entity_id: String,
    pub date: NaiveDate,
    pub lags: Vec<Option<f64>>,
}

impl FeatureRow {
    pub fn lag(&self, i: usize) -> Option<f64> {
        i.checked_sub(1)
            .and_then(|idx| self.lags.get(idx).copied().flatten())
    }
}

impl From<&Observation> for FeatureRow {
    fn from(obs: &Observation) -> Self {
        Self {
            entity_id: obs.entity_id.clone(),
            date: obs.date,
            lags: obs.lags.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitReport {
    pub input_rows: u64,
    pub train_rows_before_drop: u64,
    pub test_rows_before_drop: u64,
    pub train_rows_dropped: u64,
    pub test_rows_dropped: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitResult {
    pub train_features: Vec<FeatureRow>,
    pub test_features: Vec<FeatureRow>,
    pub train_labels: Vec<f64>,
    pub test_labels: Vec<f64>,
    pub report: SplitReport,
}

#[derive(Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub fn lag_column_names(n_lags: usize) -> Vec<String> {
    (1..=n_lags)
        .map(|i| format!("{LAG_COLUMN_PREFIX}{i}"))
        .collect()
}

pub fn compute_log_returns(panel: &Panel) -> Panel {
    let mut observations = panel.observations.clone();
    let mut undefined = 0u64;

    for indices in entity_sequences(&panel.observations).into_values() {
        for (pos, idx) in indices.iter().enumerate() {
            let value = match pos.checked_sub(1) {
                Some(prev_pos) => log_diff(
                    panel.observations[indices[prev_pos]].close_price,
                    panel.observations[*idx].close_price,
                ),
                None => None,
            };
            if value.is_none() {
                undefined += 1;
            }
            observations[*idx].log_return = value;
        }
    }

    debug!(
        component = "features",
        event = "features.log_returns.computed",
        rows = observations.len(),
        undefined_returns = undefined
    );

    Panel { observations }
}

pub fn add_lag_features(panel: &Panel, n_lags: usize) -> Result<Panel, FeatureError> {
    validate_n_lags(n_lags)?;

    let mut observations = panel.observations.clone();
    for indices in entity_sequences(&panel.observations).into_values() {
        for (pos, idx) in indices.iter().enumerate() {
            observations[*idx].lags = (1..=n_lags)
                .map(|i| {
                    pos.checked_sub(i)
                        .and_then(|earlier| panel.observations[indices[earlier]].log_return)
                })
                .collect();
        }
    }

    debug!(
        component = "features",
        event = "features.lags.added",
        rows = observations.len(),
        n_lags
    );

    Ok(Panel { observations })
}

pub fn chronological_split(panel: &Panel, train_ratio: f64) -> Result<SplitResult, FeatureError> {
    validate_train_ratio(train_ratio)?;

    let mut ordered: Vec<&Observation> = panel.observations.iter().collect();
    ordered.sort_by_key(|obs| obs.date);

    let cut = train_cut(ordered.len(), train_ratio);
    let (train_part, test_part) = ordered.split_at(cut);

    let (train_features, train_labels, train_rows_dropped) = extract_aligned(train_part);
    let (test_features, test_labels, test_rows_dropped) = extract_aligned(test_part);

    let report = SplitReport {
        input_rows: ordered.len() as u64,
        train_rows_before_drop: train_part.len() as u64,
        test_rows_before_drop: test_part.len() as u64,
        train_rows_dropped,
        test_rows_dropped,
    };

    info!(
        component = "features",
        event = "features.split.finish",
        input_rows = report.input_rows,
        train_ratio,
        train_rows = train_labels.len(),
        test_rows = test_labels.len(),
        train_rows_dropped,
        test_rows_dropped
    );

    Ok(SplitResult {
        train_features,
        test_features,
        train_labels,
        test_labels,
        report,
    })
}

/// One feature row per entity observed on the panel's most recent date.
///
/// Lags are recomputed against that date, so there is no label yet:
/// `lag_1` is the latest return itself and `lag_i` is the training-time
/// `lag_{i-1}` of the same row.
pub fn latest_feature_rows(panel: &Panel, n_lags: usize) -> Result<Vec<FeatureRow>, FeatureError> {
    validate_n_lags(n_lags)?;

    let Some(latest) = panel.latest_date() else {
        return Ok(Vec::new());
    };

    let mut rows = Vec::new();
    for (entity_id, indices) in entity_sequences(&panel.observations) {
        let Some(last_pos) = indices
            .iter()
            .rposition(|idx| panel.observations[*idx].date == latest)
        else {
            continue;
        };

        let lags = (1..=n_lags)
            .map(|i| {
                last_pos
                    .checked_sub(i - 1)
                    .and_then(|pos| panel.observations[indices[pos]].log_return)
            })
            .collect();

        rows.push(FeatureRow {
            entity_id: entity_id.to_string(),
            date: latest,
            lags,
        });
    }

    info!(
        component = "features",
        event = "features.inference_rows.built",
        latest_date = %latest,
        rows = rows.len(),
        n_lags
    );

    Ok(rows)
}

pub fn train_cut(total_rows: usize, train_ratio: f64) -> usize {
    ((train_ratio * total_rows as f64).floor() as usize).min(total_rows)
}

fn validate_n_lags(n_lags: usize) -> Result<(), FeatureError> {
    if n_lags < 1 {
        return Err(FeatureError::InvalidArgument(
            "n_lags must be >= 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_train_ratio(train_ratio: f64) -> Result<(), FeatureError> {
    if !(train_ratio > 0.0 && train_ratio < 1.0) {
        return Err(FeatureError::InvalidArgument(format!(
            "train_ratio must be in (0, 1), got {train_ratio}"
        )));
    }
    Ok(())
}

fn entity_sequences(observations: &[Observation]) -> BTreeMap<&str, Vec<usize>> {
    let mut groups: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (idx, obs) in observations.iter().enumerate() {
        groups.entry(obs.entity_id.as_str()).or_default().push(idx);
    }
    for indices in groups.values_mut() {
        indices.sort_by_key(|idx| observations[*idx].date);
    }
    groups
}

fn log_diff(previous: f64, current: f64) -> Option<f64> {
    if !(previous > 0.0 && current > 0.0 && previous.is_finite() && current.is_finite()) {
        return None;
    }
    let value = current.ln() - previous.ln();
    value.is_finite().then_some(value)
}

fn extract_aligned(part: &[&Observation]) -> (Vec<FeatureRow>, Vec<f64>, u64) {
    let mut sorted = part.to_vec();
    sorted.sort_by(|a, b| {
        a.entity_id
            .cmp(&b.entity_id)
            .then_with(|| a.date.cmp(&b.date))
    });

    let mut features = Vec::with_capacity(sorted.len());
    let mut labels = Vec::with_capacity(sorted.len());
    let mut dropped = 0u64;

    for obs in sorted {
        match obs.log_return {
            Some(label) => {
                features.push(FeatureRow::from(obs));
                labels.push(label);
            }
            None => dropped += 1,
        }
    }

    (features, labels, dropped)
}
