//! CSV panel snapshots and the drift reference copy.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::NaiveDate;
use csv::StringRecord;
use thiserror::Error;
use tracing::info;

use crate::features::{lag_column_names, Observation, Panel};

const BASE_COLUMNS: [&str; 4] = ["entity_id", "date", "close_price", "log_return"];
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("snapshot header mismatch at column {index}: expected '{expected}', found '{found}'")]
    HeaderMismatch {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("snapshot row {row} has {found} columns, expected {expected}")]
    RowWidth {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("failed to parse {field} value '{value}' on row {row}")]
    ParseField {
        row: usize,
        field: &'static str,
        value: String,
    },
    #[error("invalid output path: {0}")]
    InvalidPath(String),
}

pub fn write_panel_snapshot(path: &Path, panel: &Panel) -> Result<(), SnapshotError> {
    let n_lags = panel.n_lags();
    let mut writer = csv::Writer::from_writer(Vec::new());

    let mut header: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(lag_column_names(n_lags));
    writer.write_record(&header)?;

    for obs in &panel.observations {
        let mut record = vec![
            obs.entity_id.clone(),
            obs.date.format(DATE_FORMAT).to_string(),
            obs.close_price.to_string(),
            format_optional(obs.log_return),
        ];
        record.extend((1..=n_lags).map(|i| format_optional(obs.lag(i))));
        writer.write_record(&record)?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|err| SnapshotError::Io(err.into_error()))?;
    write_atomic(path, &bytes)?;

    info!(
        component = "snapshot",
        event = "snapshot.panel.written",
        path = %path.display(),
        rows = panel.len(),
        n_lags
    );

    Ok(())
}

pub fn read_panel_snapshot(path: &Path) -> Result<Panel, SnapshotError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;

    let header = reader.headers()?.clone();
    let n_lags = validate_header(&header)?;
    let width = BASE_COLUMNS.len() + n_lags;

    let mut observations = Vec::new();
    for (idx, record) in reader.records().enumerate() {
        let record = record?;
        let row = idx + 1;
        if record.len() != width {
            return Err(SnapshotError::RowWidth {
                row,
                found: record.len(),
                expected: width,
            });
        }

        let date_raw = record.get(1).unwrap_or_default();
        let date = NaiveDate::parse_from_str(date_raw, DATE_FORMAT).map_err(|_| {
            SnapshotError::ParseField {
                row,
                field: "date",
                value: date_raw.to_string(),
            }
        })?;

        let lags = (0..n_lags)
            .map(|i| parse_optional(&record, BASE_COLUMNS.len() + i, row, "lag"))
            .collect::<Result<Vec<_>, _>>()?;

        observations.push(Observation {
            entity_id: record.get(0).unwrap_or_default().to_string(),
            date,
            close_price: parse_required(&record, 2, row, "close_price")?,
            log_return: parse_optional(&record, 3, row, "log_return")?,
            lags,
        });
    }

    info!(
        component = "snapshot",
        event = "snapshot.panel.read",
        path = %path.display(),
        rows = observations.len(),
        n_lags
    );

    Ok(Panel::new(observations))
}

/// Copies the current snapshot to `reference` unless a reference already exists.
/// Returns whether a new reference was created.
pub fn ensure_reference_snapshot(current: &Path, reference: &Path) -> Result<bool, SnapshotError> {
    if reference.exists() {
        return Ok(false);
    }

    let bytes = fs::read(current)?;
    write_atomic(reference, &bytes)?;

    info!(
        component = "snapshot",
        event = "snapshot.reference.created",
        source = %current.display(),
        path = %reference.display()
    );

    Ok(true)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| SnapshotError::InvalidPath(path.display().to_string()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

fn validate_header(header: &StringRecord) -> Result<usize, SnapshotError> {
    for (index, expected) in BASE_COLUMNS.iter().enumerate() {
        let found = header.get(index).unwrap_or_default();
        if found != *expected {
            return Err(SnapshotError::HeaderMismatch {
                index,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
    }

    let n_lags = header.len().saturating_sub(BASE_COLUMNS.len());
    for (offset, expected) in lag_column_names(n_lags).iter().enumerate() {
        let index = BASE_COLUMNS.len() + offset;
        let found = header.get(index).unwrap_or_default();
        if found != expected {
            return Err(SnapshotError::HeaderMismatch {
                index,
                expected: expected.clone(),
                found: found.to_string(),
            });
        }
    }
    Ok(n_lags)
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_required(
    record: &StringRecord,
    idx: usize,
    row: usize,
    field: &'static str,
) -> Result<f64, SnapshotError> {
    let raw = record.get(idx).unwrap_or_default();
    parse_finite(raw, row, field)
}

fn parse_optional(
    record: &StringRecord,
    idx: usize,
    row: usize,
    field: &'static str,
) -> Result<Option<f64>, SnapshotError> {
    let raw = record.get(idx).unwrap_or_default();
    if raw.is_empty() {
        return Ok(None);
    }
    parse_finite(raw, row, field).map(Some)
}

// Missing values are empty cells; `NaN` or `inf` text is a malformed cell.
fn parse_finite(raw: &str, row: usize, field: &'static str) -> Result<f64, SnapshotError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(SnapshotError::ParseField {
            row,
            field,
            value: raw.to_string(),
        }),
    }
}
