//! Reference vs. current drift reports and the on-disk monitoring workspace.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{lag_column_names, FeatureRow, Panel};
use crate::model::{ModelError, RegressionMetrics, TrainedModel};
use crate::snapshot::{write_atomic, SnapshotError};

pub const DEFAULT_PROJECT_NAME: &str = "Algorhythmic Trading";
pub const DRIFT_P_VALUE_THRESHOLD: f64 = 0.05;
pub const DATASET_DRIFT_SHARE: f64 = 0.5;

const PROJECT_FILE: &str = "project.json";
const REPORTS_DIR: &str = "reports";
const KS_SERIES_TERMS: usize = 100;
// Sample-size product up to which the exact KS distribution is used.
const KS_EXACT_MAX_CELLS: usize = 250_000;

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Write(#[from] SnapshotError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("{which} data has no complete rows")]
    EmptyFrame { which: &'static str },
    #[error("reference and current data share no feature columns")]
    NoSharedColumns,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringFrame {
    pub entity_ids: Vec<String>,
    pub dates: Vec<NaiveDate>,
    pub features: BTreeMap<String, Vec<f64>>,
    pub target: Vec<f64>,
    pub prediction: Vec<f64>,
}

impl MonitoringFrame {
    pub fn len(&self) -> usize {
        self.target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
    }
}

pub fn prepare_monitoring_frame(
    panel: &Panel,
    model: &TrainedModel,
) -> Result<MonitoringFrame, DriftError> {
    let n_lags = panel.n_lags();
    let complete: Vec<_> = panel
        .observations
        .iter()
        .filter(|obs| {
            obs.close_price.is_finite()
                && obs.log_return.is_some_and(f64::is_finite)
                && obs.lags.len() == n_lags
                && obs.lags.iter().all(|lag| lag.is_some_and(f64::is_finite))
        })
        .collect();

    let rows: Vec<FeatureRow> = complete.iter().map(|obs| FeatureRow::from(*obs)).collect();
    let predictions = model.predict_rows(&rows)?;

    let lag_names = lag_column_names(n_lags);
    let mut features: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    features.insert("close_price".to_string(), Vec::with_capacity(complete.len()));
    for name in &lag_names {
        features.insert(name.clone(), Vec::with_capacity(complete.len()));
    }

    let mut frame = MonitoringFrame {
        entity_ids: Vec::with_capacity(complete.len()),
        dates: Vec::with_capacity(complete.len()),
        features,
        target: Vec::with_capacity(complete.len()),
        prediction: Vec::with_capacity(complete.len()),
    };

    for (obs, prediction) in complete.iter().zip(predictions) {
        let (Some(target), Some(prediction)) = (obs.log_return, prediction) else {
            continue;
        };
        frame.entity_ids.push(obs.entity_id.clone());
        frame.dates.push(obs.date);
        frame.target.push(target);
        frame.prediction.push(prediction);
        if let Some(column) = frame.features.get_mut("close_price") {
            column.push(obs.close_price);
        }
        for (name, value) in lag_names.iter().zip(&obs.lags) {
            if let (Some(column), Some(value)) = (frame.features.get_mut(name), value) {
                column.push(*value);
            }
        }
    }

    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KsTest {
    pub statistic: f64,
    pub p_value: f64,
}

pub fn ks_two_sample(reference: &[f64], current: &[f64]) -> KsTest {
    let mut a: Vec<f64> = reference.iter().copied().filter(|v| v.is_finite()).collect();
    let mut b: Vec<f64> = current.iter().copied().filter(|v| v.is_finite()).collect();
    if a.is_empty() || b.is_empty() {
        return KsTest {
            statistic: 0.0,
            p_value: 1.0,
        };
    }
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);

    let (n1, n2) = (a.len() as f64, b.len() as f64);
    let (mut i, mut j) = (0_usize, 0_usize);
    let mut statistic = 0.0_f64;
    while i < a.len() && j < b.len() {
        let x = a[i].min(b[j]);
        while i < a.len() && a[i] <= x {
            i += 1;
        }
        while j < b.len() && b[j] <= x {
            j += 1;
        }
        statistic = statistic.max((i as f64 / n1 - j as f64 / n2).abs());
    }

    let p_value = if a.len().saturating_mul(b.len()) <= KS_EXACT_MAX_CELLS {
        ks_exact_p_value(a.len(), b.len(), statistic)
    } else {
        let en = (n1 * n2 / (n1 + n2)).sqrt();
        kolmogorov_q((en + 0.12 + 0.11 / en) * statistic)
    };
    KsTest { statistic, p_value }
}

/// Probability that a uniformly random merge order of the two samples
/// reaches an ECDF gap of at least `statistic`.
fn ks_exact_p_value(n1: usize, n2: usize, statistic: f64) -> f64 {
    let (m, n) = (n1 as i64, n2 as i64);
    let threshold = (statistic * (m * n) as f64).round() as i64;
    if threshold <= 0 {
        return 1.0;
    }

    let mut prev = vec![0.0_f64; n2 + 1];
    let mut cur = vec![0.0_f64; n2 + 1];
    for i in 0..=n1 {
        for j in 0..=n2 {
            let gap = (i as i64 * n - j as i64 * m).abs();
            if gap >= threshold {
                cur[j] = 0.0;
                continue;
            }
            if i == 0 && j == 0 {
                cur[j] = 1.0;
                continue;
            }
            let mut mass = 0.0;
            if i > 0 {
                let (left_a, left_b) = ((n1 - i + 1) as f64, (n2 - j) as f64);
                mass += prev[j] * left_a / (left_a + left_b);
            }
            if j > 0 {
                let (left_a, left_b) = ((n1 - i) as f64, (n2 - j + 1) as f64);
                mass += cur[j - 1] * left_b / (left_a + left_b);
            }
            cur[j] = mass;
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    (1.0 - prev[n2]).clamp(0.0, 1.0)
}

fn kolmogorov_q(lambda: f64) -> f64 {
    let mut sum = 0.0;
    let mut sign = 1.0;
    for k in 1..=KS_SERIES_TERMS {
        let term = sign * (-2.0 * (k as f64).powi(2) * lambda * lambda).exp();
        sum += term;
        if term.abs() < 1e-12 {
            return (2.0 * sum).clamp(0.0, 1.0);
        }
        sign = -sign;
    }
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDrift {
    pub column: String,
    pub statistic: f64,
    pub p_value: f64,
    pub drifted: bool,
}

impl ColumnDrift {
    fn from_samples(column: &str, reference: &[f64], current: &[f64]) -> Self {
        let test = ks_two_sample(reference, current);
        Self {
            column: column.to_string(),
            statistic: test.statistic,
            p_value: test.p_value,
            drifted: test.p_value < DRIFT_P_VALUE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSummary {
    pub column: String,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

impl ColumnSummary {
    fn from_values(column: &str, values: &[f64]) -> Self {
        let values: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = if values.len() > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        Self {
            column: column.to_string(),
            mean,
            std: var.sqrt(),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub generated_at: String,
    pub reference_rows: usize,
    pub current_rows: usize,
    pub columns: Vec<ColumnDrift>,
    pub share_of_drifted_columns: f64,
    pub dataset_drift: bool,
    pub target_drift: ColumnDrift,
    pub prediction_drift: ColumnDrift,
    pub regression: RegressionMetrics,
    pub data_quality: Vec<ColumnSummary>,
}

pub fn build_drift_report(
    reference: &MonitoringFrame,
    current: &MonitoringFrame,
) -> Result<DriftReport, DriftError> {
    if reference.is_empty() {
        return Err(DriftError::EmptyFrame { which: "reference" });
    }
    if current.is_empty() {
        return Err(DriftError::EmptyFrame { which: "current" });
    }

    let columns: Vec<ColumnDrift> = current
        .features
        .iter()
        .filter_map(|(name, values)| {
            reference
                .features
                .get(name)
                .map(|reference_values| ColumnDrift::from_samples(name, reference_values, values))
        })
        .collect();
    if columns.is_empty() {
        return Err(DriftError::NoSharedColumns);
    }

    let drifted = columns.iter().filter(|column| column.drifted).count();
    let share_of_drifted_columns = drifted as f64 / columns.len() as f64;

    let mut data_quality: Vec<ColumnSummary> = current
        .features
        .iter()
        .map(|(name, values)| ColumnSummary::from_values(name, values))
        .collect();
    data_quality.push(ColumnSummary::from_values("target", &current.target));
    data_quality.push(ColumnSummary::from_values("prediction", &current.prediction));

    let report = DriftReport {
        generated_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        reference_rows: reference.len(),
        current_rows: current.len(),
        share_of_drifted_columns,
        dataset_drift: share_of_drifted_columns >= DATASET_DRIFT_SHARE,
        target_drift: ColumnDrift::from_samples("target", &reference.target, &current.target),
        prediction_drift: ColumnDrift::from_samples(
            "prediction",
            &reference.prediction,
            &current.prediction,
        ),
        regression: RegressionMetrics::calculate(&current.target, &current.prediction),
        columns,
        data_quality,
    };

    info!(
        component = "drift",
        event = "drift.report.built",
        reference_rows = report.reference_rows,
        current_rows = report.current_rows,
        share_of_drifted_columns = report.share_of_drifted_columns,
        dataset_drift = report.dataset_drift,
        target_drift_score = report.target_drift.p_value,
        mape = report.regression.mape
    );
    if report.dataset_drift {
        warn!(
            component = "drift",
            event = "drift.dataset.detected",
            drifted_columns = drifted
        );
    }

    Ok(report)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelKind {
    Counter,
    LinePlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelMetric {
    PredictionCount,
    DatasetDriftShare,
    TargetDriftScore,
    Mape,
}

impl PanelMetric {
    pub fn value(self, report: &DriftReport) -> f64 {
        match self {
            Self::PredictionCount => report.current_rows as f64,
            Self::DatasetDriftShare => report.share_of_drifted_columns,
            Self::TargetDriftScore => report.target_drift.p_value,
            Self::Mape => report.regression.mape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardPanel {
    pub title: String,
    pub kind: PanelKind,
    pub metric: PanelMetric,
    pub legend: String,
    pub size: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringProject {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub panels: Vec<DashboardPanel>,
}

fn default_panels() -> Vec<DashboardPanel> {
    let panel = |title: &str, kind, metric, legend: &str, size| DashboardPanel {
        title: title.to_string(),
        kind,
        metric,
        legend: legend.to_string(),
        size,
    };
    vec![
        panel(
            "Stock Price Growth Rate Prediction",
            PanelKind::Counter,
            PanelMetric::PredictionCount,
            "Predictions",
            1,
        ),
        panel(
            "Dataset Drift",
            PanelKind::LinePlot,
            PanelMetric::DatasetDriftShare,
            "Drift Share",
            1,
        ),
        panel(
            "Target Drift",
            PanelKind::LinePlot,
            PanelMetric::TargetDriftScore,
            "Drift Score",
            1,
        ),
        panel("MAPE", PanelKind::LinePlot, PanelMetric::Mape, "MAPE", 2),
    ]
}

#[derive(Debug, Clone)]
pub struct MonitoringWorkspace {
    root: PathBuf,
    project: MonitoringProject,
}

impl MonitoringWorkspace {
    pub fn open_or_create(root: &Path, project_name: &str) -> Result<Self, DriftError> {
        let project_path = root.join(PROJECT_FILE);
        if project_path.exists() {
            let project: MonitoringProject = serde_json::from_slice(&fs::read(&project_path)?)?;
            return Ok(Self {
                root: root.to_path_buf(),
                project,
            });
        }

        fs::create_dir_all(root.join(REPORTS_DIR))?;
        let created_at = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
        let mut hasher = Sha256::new();
        hasher.update(project_name.as_bytes());
        hasher.update(created_at.as_bytes());
        let mut id = hex::encode(hasher.finalize());
        id.truncate(32);

        let project = MonitoringProject {
            id,
            name: project_name.to_string(),
            created_at,
            panels: default_panels(),
        };
        write_atomic(&project_path, &serde_json::to_vec_pretty(&project)?)?;

        info!(
            component = "drift",
            event = "drift.workspace.created",
            path = %root.display(),
            project = %project.name,
            panels = project.panels.len()
        );

        Ok(Self {
            root: root.to_path_buf(),
            project,
        })
    }

    pub fn project(&self) -> &MonitoringProject {
        &self.project
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn add_report(&self, report: &DriftReport) -> Result<PathBuf, DriftError> {
        let reports_dir = self.root.join(REPORTS_DIR);
        fs::create_dir_all(&reports_dir)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut path = reports_dir.join(format!("report-{stamp}.json"));
        let mut suffix = 1;
        while path.exists() {
            path = reports_dir.join(format!("report-{stamp}-{suffix}.json"));
            suffix += 1;
        }

        write_atomic(&path, &serde_json::to_vec_pretty(report)?)?;
        info!(
            component = "drift",
            event = "drift.report.stored",
            project = %self.project.name,
            path = %path.display()
        );
        Ok(path)
    }

    pub fn list_reports(&self) -> Result<Vec<DriftReport>, DriftError> {
        list_reports_in(&self.root)
    }
}

pub fn list_reports_in(root: &Path) -> Result<Vec<DriftReport>, DriftError> {
    let reports_dir = root.join(REPORTS_DIR);
    if !reports_dir.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(&reports_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        reports.push(serde_json::from_slice::<DriftReport>(&fs::read(&path)?)?);
    }
    reports.sort_by(|a, b| a.generated_at.cmp(&b.generated_at));
    Ok(reports)
}
