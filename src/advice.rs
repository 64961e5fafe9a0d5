//! Next-day BUY/SELL advice from the production model.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::features::FeatureRow;
use crate::model::{ModelError, TrainedModel};
use crate::snapshot::{write_atomic, SnapshotError};

#[derive(Debug, Error)]
pub enum AdviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Write(#[from] SnapshotError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("model needs {required} lag columns but inference rows carry {available}")]
    IncompatibleRows { required: usize, available: usize },
    #[error("no inference rows to advise on")]
    NoRows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn from_prediction(prediction: f64) -> Self {
        if prediction > 0.0 {
            Self::Buy
        } else {
            Self::Sell
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => f.write_str("BUY"),
            Self::Sell => f.write_str("SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdviceEntry {
    pub prediction: f64,
    pub advice: Direction,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AdviceDocument {
    pub entries: BTreeMap<String, AdviceEntry>,
}

impl AdviceDocument {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, entity_id: &str) -> Option<&AdviceEntry> {
        self.entries.get(entity_id)
    }
}

pub fn assert_rows_compatible(
    model: &TrainedModel,
    rows: &[FeatureRow],
) -> Result<(), AdviceError> {
    let required = model.n_lags_used();
    let available = rows.iter().map(|row| row.lags.len()).min().unwrap_or(0);
    if available < required {
        return Err(AdviceError::IncompatibleRows {
            required,
            available,
        });
    }
    Ok(())
}

pub fn make_advice(
    model: &TrainedModel,
    rows: &[FeatureRow],
) -> Result<AdviceDocument, AdviceError> {
    if rows.is_empty() {
        return Err(AdviceError::NoRows);
    }
    assert_rows_compatible(model, rows)?;

    let predictions = model.predict_rows(rows)?;
    let mut document = AdviceDocument::default();
    let mut skipped = 0_usize;
    let as_of: Option<NaiveDate> = rows.iter().map(|row| row.date).max();

    for (row, prediction) in rows.iter().zip(predictions) {
        match prediction {
            Some(prediction) => {
                document.entries.insert(
                    row.entity_id.clone(),
                    AdviceEntry {
                        prediction,
                        advice: Direction::from_prediction(prediction),
                    },
                );
            }
            None => {
                skipped += 1;
                warn!(
                    component = "advice",
                    event = "advice.row.skipped",
                    entity_id = %row.entity_id,
                    date = %row.date,
                    reason = "missing_lag"
                );
            }
        }
    }

    let buys = document
        .entries
        .values()
        .filter(|entry| entry.advice == Direction::Buy)
        .count();
    info!(
        component = "advice",
        event = "advice.generated",
        as_of = ?as_of,
        entities = document.len(),
        buys,
        sells = document.len() - buys,
        skipped
    );

    Ok(document)
}

pub fn write_advice(path: &Path, document: &AdviceDocument) -> Result<(), AdviceError> {
    let bytes = serde_json::to_vec_pretty(document)?;
    write_atomic(path, &bytes)?;
    info!(
        component = "advice",
        event = "advice.written",
        path = %path.display(),
        entities = document.len()
    );
    Ok(())
}

pub fn read_advice(path: &Path) -> Result<AdviceDocument, AdviceError> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
