//! SQLite-backed experiment tracking and model registry.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::model::{assert_schema_compatible, CandidateOutcome, ModelError, TrainedModel};

const RUN_ID_HEX_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("artifact serialization error: {0}")]
    Artifact(#[from] serde_json::Error),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("unknown experiment '{0}'")]
    UnknownExperiment(String),
    #[error("experiment '{0}' has no runs with a finite MAPE")]
    NoRuns(String),
    #[error("unknown run '{0}'")]
    UnknownRun(String),
    #[error("model '{name}' has no version {version}")]
    UnknownVersion { name: String, version: u32 },
    #[error("no model '{name}' in stage {stage}")]
    NoModelInStage { name: String, stage: Stage },
    #[error("invalid stage '{0}'")]
    InvalidStage(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Staging => "Staging",
            Self::Production => "Production",
            Self::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = RegistryError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "staging" => Ok(Self::Staging),
            "production" => Ok(Self::Production),
            "archived" => Ok(Self::Archived),
            _ => Err(RegistryError::InvalidStage(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub experiment: String,
    pub n_lags_used: usize,
    pub mse: f64,
    pub mae: f64,
    pub r2: f64,
    pub mape: f64,
    pub n_train: usize,
    pub n_test: usize,
    pub schema_fingerprint: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u32,
    pub run_id: String,
    pub stage: Stage,
    pub created_at: String,
}

pub struct ModelRegistry {
    conn: Connection,
}

impl ModelRegistry {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            ",
        )?;
        let registry = Self { conn };
        registry.ensure_schema()?;

        info!(
            component = "registry",
            event = "registry.opened",
            path = %path.display()
        );
        Ok(registry)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let registry = Self { conn };
        registry.ensure_schema()?;
        Ok(registry)
    }

    fn ensure_schema(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS experiments (
                experiment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                experiment_id INTEGER NOT NULL REFERENCES experiments(experiment_id),
                n_lags_used INTEGER NOT NULL,
                mse REAL,
                mae REAL,
                r2 REAL,
                mape REAL,
                n_train INTEGER NOT NULL,
                n_test INTEGER NOT NULL,
                schema_fingerprint TEXT NOT NULL,
                artifact TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS model_versions (
                name TEXT NOT NULL,
                version INTEGER NOT NULL,
                run_id TEXT NOT NULL REFERENCES runs(run_id),
                stage TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (name, version)
            );
            ",
        )?;
        Ok(())
    }

    pub fn get_or_create_experiment(&self, name: &str) -> Result<i64, RegistryError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO experiments (name, created_at) VALUES (?1, ?2)",
            params![name, now_rfc3339()],
        )?;
        let id = self.conn.query_row(
            "SELECT experiment_id FROM experiments WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn log_run(
        &mut self,
        experiment: &str,
        outcome: &CandidateOutcome,
    ) -> Result<String, RegistryError> {
        let experiment_id = self.get_or_create_experiment(experiment)?;
        let created_at = now_rfc3339();
        let existing: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE experiment_id = ?1",
            params![experiment_id],
            |row| row.get(0),
        )?;
        let run_id = make_run_id(experiment, outcome.n_lags_used, existing, &created_at);
        let artifact = serde_json::to_string(&outcome.model)?;
        let metrics = &outcome.metrics;

        self.conn.execute(
            "
            INSERT INTO runs (
                run_id,
                experiment_id,
                n_lags_used,
                mse,
                mae,
                r2,
                mape,
                n_train,
                n_test,
                schema_fingerprint,
                artifact,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
            params![
                run_id,
                experiment_id,
                outcome.n_lags_used as i64,
                finite_or_null(metrics.mse),
                finite_or_null(metrics.mae),
                finite_or_null(metrics.r2),
                finite_or_null(metrics.mape),
                outcome.model.n_train_rows as i64,
                metrics.n_samples as i64,
                outcome.model.preprocessor.schema_fingerprint(),
                artifact,
                created_at,
            ],
        )?;

        info!(
            component = "registry",
            event = "registry.run.logged",
            experiment,
            run_id = %run_id,
            n_lags_used = outcome.n_lags_used,
            n_train = outcome.model.n_train_rows,
            mse = metrics.mse,
            r2 = metrics.r2,
            mape = metrics.mape
        );
        Ok(run_id)
    }

    pub fn list_runs(&self, experiment: &str) -> Result<Vec<RunRecord>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT
                r.run_id,
                e.name,
                r.n_lags_used,
                r.mse,
                r.mae,
                r.r2,
                r.mape,
                r.n_train,
                r.n_test,
                r.schema_fingerprint,
                r.created_at
            FROM runs r
            JOIN experiments e ON e.experiment_id = r.experiment_id
            WHERE e.name = ?1
            ORDER BY r.created_at ASC, r.rowid ASC
            ",
        )?;
        let runs = stmt
            .query_map(params![experiment], run_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    pub fn best_run(&self, experiment: &str) -> Result<RunRecord, RegistryError> {
        let runs = self.list_runs(experiment)?;
        if runs.is_empty() {
            let known: Option<i64> = self
                .conn
                .query_row(
                    "SELECT experiment_id FROM experiments WHERE name = ?1",
                    params![experiment],
                    |row| row.get(0),
                )
                .optional()?;
            if known.is_none() {
                return Err(RegistryError::UnknownExperiment(experiment.to_string()));
            }
        }
        runs.into_iter()
            .filter(|run| run.mape.is_finite())
            .fold(None::<RunRecord>, |best, run| match best {
                Some(current) if current.mape <= run.mape => Some(current),
                _ => Some(run),
            })
            .ok_or_else(|| RegistryError::NoRuns(experiment.to_string()))
    }

    pub fn load_run_model(&self, run_id: &str) -> Result<TrainedModel, RegistryError> {
        let found: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT artifact, schema_fingerprint FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (artifact, fingerprint) =
            found.ok_or_else(|| RegistryError::UnknownRun(run_id.to_string()))?;
        let model: TrainedModel = serde_json::from_str(&artifact)?;
        assert_schema_compatible(&fingerprint, &model.preprocessor)?;
        Ok(model)
    }

    pub fn register_model(
        &mut self,
        name: &str,
        run_id: &str,
    ) -> Result<ModelVersion, RegistryError> {
        let run_exists: Option<String> = self
            .conn
            .query_row(
                "SELECT run_id FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        if run_exists.is_none() {
            return Err(RegistryError::UnknownRun(run_id.to_string()));
        }

        let tx = self.conn.transaction()?;
        let next: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM model_versions WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )?;
        let created_at = now_rfc3339();
        tx.execute(
            "
            INSERT INTO model_versions (name, version, run_id, stage, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![name, next, run_id, Stage::None.as_str(), created_at],
        )?;
        tx.commit()?;

        let version = ModelVersion {
            name: name.to_string(),
            version: next as u32,
            run_id: run_id.to_string(),
            stage: Stage::None,
            created_at,
        };
        info!(
            component = "registry",
            event = "registry.model.registered",
            name,
            version = version.version,
            run_id
        );
        Ok(version)
    }

    /// Moves one version to `stage`; with `archive_existing`, other versions
    /// of the same model currently in that stage become `Archived`.
    pub fn transition_stage(
        &mut self,
        name: &str,
        version: u32,
        stage: Stage,
        archive_existing: bool,
    ) -> Result<ModelVersion, RegistryError> {
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE model_versions SET stage = ?3 WHERE name = ?1 AND version = ?2",
            params![name, version as i64, stage.as_str()],
        )?;
        if updated == 0 {
            return Err(RegistryError::UnknownVersion {
                name: name.to_string(),
                version,
            });
        }

        let mut archived = 0;
        if archive_existing && matches!(stage, Stage::Staging | Stage::Production) {
            archived = tx.execute(
                "
                UPDATE model_versions
                SET stage = ?4
                WHERE name = ?1 AND version != ?2 AND stage = ?3
                ",
                params![
                    name,
                    version as i64,
                    stage.as_str(),
                    Stage::Archived.as_str()
                ],
            )?;
        }
        tx.commit()?;

        info!(
            component = "registry",
            event = "registry.model.transitioned",
            name,
            version,
            stage = %stage,
            archived
        );

        self.get_version(name, version)?
            .ok_or_else(|| RegistryError::UnknownVersion {
                name: name.to_string(),
                version,
            })
    }

    pub fn get_version(
        &self,
        name: &str,
        version: u32,
    ) -> Result<Option<ModelVersion>, RegistryError> {
        let found = self
            .conn
            .query_row(
                "
                SELECT name, version, run_id, stage, created_at
                FROM model_versions
                WHERE name = ?1 AND version = ?2
                ",
                params![name, version as i64],
                version_columns,
            )
            .optional()?;
        found.map(version_from_columns).transpose()
    }

    pub fn list_versions(&self, name: &str) -> Result<Vec<ModelVersion>, RegistryError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT name, version, run_id, stage, created_at
            FROM model_versions
            WHERE name = ?1
            ORDER BY version ASC
            ",
        )?;
        let rows = stmt
            .query_map(params![name], version_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(version_from_columns).collect()
    }

    pub fn latest_version_in_stage(
        &self,
        name: &str,
        stage: Stage,
    ) -> Result<Option<ModelVersion>, RegistryError> {
        let found = self
            .conn
            .query_row(
                "
                SELECT name, version, run_id, stage, created_at
                FROM model_versions
                WHERE name = ?1 AND stage = ?2
                ORDER BY version DESC
                LIMIT 1
                ",
                params![name, stage.as_str()],
                version_columns,
            )
            .optional()?;
        found.map(version_from_columns).transpose()
    }

    pub fn load_model(
        &self,
        name: &str,
        stage: Stage,
    ) -> Result<(ModelVersion, TrainedModel), RegistryError> {
        let version = self
            .latest_version_in_stage(name, stage)?
            .ok_or_else(|| RegistryError::NoModelInStage {
                name: name.to_string(),
                stage,
            })?;
        let model = self.load_run_model(&version.run_id)?;
        Ok((version, model))
    }

    pub fn latest_model_in_stage(
        &self,
        name_prefix: &str,
        stage: Stage,
    ) -> Result<(ModelVersion, TrainedModel), RegistryError> {
        let pattern = format!("{}%", escape_like(name_prefix));
        let found = self
            .conn
            .query_row(
                "
                SELECT name, version, run_id, stage, created_at
                FROM model_versions
                WHERE name LIKE ?1 ESCAPE '\\' AND stage = ?2
                ORDER BY created_at DESC, rowid DESC
                LIMIT 1
                ",
                params![pattern, stage.as_str()],
                version_columns,
            )
            .optional()?;
        let version = found
            .map(version_from_columns)
            .transpose()?
            .ok_or_else(|| RegistryError::NoModelInStage {
                name: format!("{name_prefix}*"),
                stage,
            })?;
        let model = self.load_run_model(&version.run_id)?;
        Ok((version, model))
    }
}

pub fn register_best_model(
    registry: &mut ModelRegistry,
    experiment: &str,
    model_name: &str,
) -> Result<ModelVersion, RegistryError> {
    let best = registry.best_run(experiment)?;
    info!(
        component = "registry",
        event = "registry.best_run.selected",
        experiment,
        run_id = %best.run_id,
        n_lags_used = best.n_lags_used,
        mape = best.mape
    );
    let registered = registry.register_model(model_name, &best.run_id)?;
    registry.transition_stage(model_name, registered.version, Stage::Production, true)
}

fn make_run_id(experiment: &str, n_lags_used: usize, ordinal: i64, created_at: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(experiment.as_bytes());
    hasher.update(format!("|{n_lags_used}|{ordinal}|{created_at}"));
    let mut id = hex::encode(hasher.finalize());
    id.truncate(RUN_ID_HEX_LEN);
    id
}

fn finite_or_null(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

fn null_as_nan(value: Option<f64>) -> f64 {
    value.unwrap_or(f64::NAN)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        run_id: row.get(0)?,
        experiment: row.get(1)?,
        n_lags_used: row.get::<_, i64>(2)? as usize,
        mse: null_as_nan(row.get(3)?),
        mae: null_as_nan(row.get(4)?),
        r2: null_as_nan(row.get(5)?),
        mape: null_as_nan(row.get(6)?),
        n_train: row.get::<_, i64>(7)? as usize,
        n_test: row.get::<_, i64>(8)? as usize,
        schema_fingerprint: row.get(9)?,
        created_at: row.get(10)?,
    })
}

type VersionColumns = (String, i64, String, String, String);

fn version_columns(row: &Row<'_>) -> rusqlite::Result<VersionColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn version_from_columns(
    (name, version, run_id, stage, created_at): VersionColumns,
) -> Result<ModelVersion, RegistryError> {
    Ok(ModelVersion {
        name,
        version: version as u32,
        run_id,
        stage: stage.parse()?,
        created_at,
    })
}
