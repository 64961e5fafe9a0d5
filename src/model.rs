//! One-hot + lag preprocessing, OLS regression and the lag-count sweep.

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{lag_column_names, FeatureRow, SplitResult};

const RIDGE_STEPS: [f64; 4] = [1e-10, 1e-8, 1e-6, 1e-4];

#[derive(Debug, Error, PartialEq)]
pub enum ModelError {
    #[error("invalid model argument: {0}")]
    InvalidArgument(String),
    #[error("requested {requested} lag columns but rows only carry {available}")]
    NotEnoughLagColumns { requested: usize, available: usize },
    #[error("no complete training rows for {n_lags_used} lags")]
    EmptyTrainingSet { n_lags_used: usize },
    #[error("no complete evaluation rows for {n_lags_used} lags")]
    EmptyEvaluationSet { n_lags_used: usize },
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("normal equations are singular")]
    SingularMatrix,
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
    #[error("no lag count produced a usable model")]
    NoViableCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preprocessor {
    pub categories: Vec<String>,
    pub n_lags_used: usize,
}

impl Preprocessor {
    pub fn fit(rows: &[FeatureRow], n_lags_used: usize) -> Result<Self, ModelError> {
        if n_lags_used < 1 {
            return Err(ModelError::InvalidArgument(
                "n_lags_used must be >= 1".to_string(),
            ));
        }
        let mut categories: Vec<String> = rows.iter().map(|row| row.entity_id.clone()).collect();
        categories.sort();
        categories.dedup();
        Ok(Self {
            categories,
            n_lags_used,
        })
    }

    pub fn n_features(&self) -> usize {
        self.categories.len() + self.n_lags_used
    }

    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .categories
            .iter()
            .map(|category| format!("entity_id_{category}"))
            .collect();
        names.extend(lag_column_names(self.n_lags_used));
        names
    }

    /// Encodes one row; `None` when any used lag is missing.
    /// Unknown entities encode as all-zero indicator columns.
    pub fn encode_row(&self, row: &FeatureRow) -> Option<Vec<f64>> {
        let mut values = vec![0.0; self.n_features()];
        if let Ok(pos) = self.categories.binary_search(&row.entity_id) {
            values[pos] = 1.0;
        }
        for i in 1..=self.n_lags_used {
            values[self.categories.len() + i - 1] = row.lag(i)?;
        }
        Some(values)
    }

    pub fn transform(&self, rows: &[FeatureRow]) -> (Array2<f64>, Vec<usize>) {
        let mut kept = Vec::with_capacity(rows.len());
        let mut flat = Vec::with_capacity(rows.len() * self.n_features());
        for (idx, row) in rows.iter().enumerate() {
            if let Some(values) = self.encode_row(row) {
                kept.push(idx);
                flat.extend(values);
            }
        }
        let matrix = Array2::from_shape_vec((kept.len(), self.n_features()), flat)
            .unwrap_or_else(|_| Array2::zeros((0, self.n_features())));
        (matrix, kept)
    }

    pub fn schema_fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update("categories:");
        for category in &self.categories {
            hasher.update(category.as_bytes());
            hasher.update(",");
        }
        hasher.update(format!(";n_lags_used:{};", self.n_lags_used));
        hex::encode(hasher.finalize())
    }
}

pub fn assert_schema_compatible(
    expected_fingerprint: &str,
    actual: &Preprocessor,
) -> Result<(), ModelError> {
    let fingerprint = actual.schema_fingerprint();
    if fingerprint != expected_fingerprint {
        return Err(ModelError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: fingerprint,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearRegression {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
}

impl LinearRegression {
    pub fn fit(x: &Array2<f64>, y: &Array1<f64>) -> Result<Self, ModelError> {
        if x.nrows() != y.len() {
            return Err(ModelError::DimensionMismatch {
                expected: x.nrows(),
                got: y.len(),
            });
        }

        let ones = Array2::<f64>::ones((x.nrows(), 1));
        let design = ndarray::concatenate(Axis(1), &[ones.view(), x.view()])
            .map_err(|_| ModelError::DimensionMismatch {
                expected: x.nrows(),
                got: ones.nrows(),
            })?;

        let xt = design.t();
        let xtx = xt.dot(&design);
        let xty = xt.dot(y);

        let n = xtx.nrows();
        let scale = (xtx.diag().sum() / n as f64).max(1.0);

        for ridge in RIDGE_STEPS {
            let mut regularized = xtx.clone();
            for i in 0..n {
                regularized[[i, i]] += ridge * scale;
            }
            if let Some(beta) = cholesky_solve(&regularized, &xty) {
                return Ok(Self {
                    intercept: beta[0],
                    coefficients: beta.iter().skip(1).copied().collect(),
                });
            }
        }

        Err(ModelError::SingularMatrix)
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>, ModelError> {
        if x.ncols() != self.coefficients.len() {
            return Err(ModelError::DimensionMismatch {
                expected: self.coefficients.len(),
                got: x.ncols(),
            });
        }
        let coefficients = Array1::from_vec(self.coefficients.clone());
        Ok(x.dot(&coefficients) + self.intercept)
    }
}

fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));

    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }
            if i == j {
                let diag = a[[i, i]] - sum;
                if !(diag > 0.0) || !diag.is_finite() {
                    return None;
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * z[j];
        }
        z[i] = (b[i] - sum) / l[[i, i]];
    }

    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (z[i] - sum) / l[[i, i]];
    }

    Some(x)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
    pub mape: f64,
    pub n_samples: usize,
}

impl RegressionMetrics {
    pub fn calculate(y_true: &[f64], y_pred: &[f64]) -> Self {
        let n = y_true.len().min(y_pred.len());
        if n == 0 {
            return Self {
                mse: f64::NAN,
                mae: f64::NAN,
                r2: f64::NAN,
                mape: f64::NAN,
                n_samples: 0,
            };
        }
        let n_f = n as f64;
        let pairs = || y_true.iter().zip(y_pred.iter()).take(n);

        let mse = pairs().map(|(t, p)| (t - p).powi(2)).sum::<f64>() / n_f;
        let mae = pairs().map(|(t, p)| (t - p).abs()).sum::<f64>() / n_f;
        let mape = pairs()
            .map(|(t, p)| (t - p).abs() / t.abs().max(f64::EPSILON))
            .sum::<f64>()
            / n_f;

        let mean = y_true.iter().take(n).sum::<f64>() / n_f;
        let ss_tot = y_true.iter().take(n).map(|t| (t - mean).powi(2)).sum::<f64>();
        let ss_res = mse * n_f;
        let r2 = if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };

        Self {
            mse,
            mae,
            r2,
            mape,
            n_samples: n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub preprocessor: Preprocessor,
    pub regression: LinearRegression,
    pub n_train_rows: usize,
}

impl TrainedModel {
    pub fn n_lags_used(&self) -> usize {
        self.preprocessor.n_lags_used
    }

    pub fn predict_rows(&self, rows: &[FeatureRow]) -> Result<Vec<Option<f64>>, ModelError> {
        let (x, kept) = self.preprocessor.transform(rows);
        let predictions = self.regression.predict(&x)?;
        let mut out = vec![None; rows.len()];
        for (pos, idx) in kept.into_iter().enumerate() {
            out[idx] = Some(predictions[pos]);
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub n_lags_used: usize,
    pub model: TrainedModel,
    pub metrics: RegressionMetrics,
}

pub fn train_candidate(
    split: &SplitResult,
    n_lags_used: usize,
) -> Result<CandidateOutcome, ModelError> {
    let available = split
        .train_features
        .iter()
        .chain(split.test_features.iter())
        .map(|row| row.lags.len())
        .min()
        .unwrap_or(0);
    if n_lags_used > available {
        return Err(ModelError::NotEnoughLagColumns {
            requested: n_lags_used,
            available,
        });
    }

    let preprocessor = Preprocessor::fit(&split.train_features, n_lags_used)?;

    let (x_train, kept_train) = preprocessor.transform(&split.train_features);
    if kept_train.is_empty() {
        return Err(ModelError::EmptyTrainingSet { n_lags_used });
    }
    let y_train: Array1<f64> = kept_train
        .iter()
        .map(|idx| split.train_labels[*idx])
        .collect();
    let regression = LinearRegression::fit(&x_train, &y_train)?;

    let (x_test, kept_test) = preprocessor.transform(&split.test_features);
    if kept_test.is_empty() {
        return Err(ModelError::EmptyEvaluationSet { n_lags_used });
    }
    let y_test: Vec<f64> = kept_test
        .iter()
        .map(|idx| split.test_labels[*idx])
        .collect();
    let y_pred = regression.predict(&x_test)?;
    let metrics = RegressionMetrics::calculate(&y_test, y_pred.as_slice().unwrap_or(&[]));

    info!(
        component = "model",
        event = "model.candidate.scored",
        n_lags_used,
        n_train = kept_train.len(),
        n_test = kept_test.len(),
        mse = metrics.mse,
        r2 = metrics.r2,
        mape = metrics.mape
    );

    Ok(CandidateOutcome {
        n_lags_used,
        model: TrainedModel {
            preprocessor,
            regression,
            n_train_rows: kept_train.len(),
        },
        metrics,
    })
}

pub fn sweep_lag_counts(
    split: &SplitResult,
    max_lags_used: usize,
) -> Result<Vec<CandidateOutcome>, ModelError> {
    if max_lags_used < 1 {
        return Err(ModelError::InvalidArgument(
            "max_lags_used must be >= 1".to_string(),
        ));
    }

    let mut outcomes = Vec::with_capacity(max_lags_used);
    for n_lags_used in 1..=max_lags_used {
        match train_candidate(split, n_lags_used) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(
                component = "model",
                event = "model.candidate.skipped",
                n_lags_used,
                error = %err
            ),
        }
    }

    if outcomes.is_empty() {
        return Err(ModelError::NoViableCandidate);
    }
    Ok(outcomes)
}

/// Lowest test MAPE wins; ties keep the smaller lag count.
pub fn best_candidate(outcomes: &[CandidateOutcome]) -> Option<&CandidateOutcome> {
    outcomes
        .iter()
        .filter(|outcome| outcome.metrics.mape.is_finite())
        .min_by(|a, b| a.metrics.mape.total_cmp(&b.metrics.mape))
}
