//! `runs` table: run_id → run directory, stage, hashes, status

use crate::manifest::{RunManifest, Stage};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registry file name inside the root folder
pub const REGISTRY_FILE: &str = "registry.db";

/// One registered run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub run_id: String,
    pub stage: Stage,
    pub run_dir: PathBuf,
    pub configuration_hash: String,
    pub reproducibility_key: String,
    pub status: String,
    pub upstream_run_ids: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Open (creating if needed) the registry database
pub async fn init_registry_pool(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    debug!("Connecting to registry: {}", db_url);
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new run registry: {}", db_path.display());
    }

    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    init_tables(&pool).await?;
    Ok(pool)
}

async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            stage TEXT NOT NULL,
            run_dir TEXT NOT NULL,
            configuration_hash TEXT NOT NULL,
            reproducibility_key TEXT NOT NULL,
            status TEXT NOT NULL,
            upstream_run_ids TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_stage ON runs(stage)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Handle on the run registry
#[derive(Debug, Clone)]
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    /// Open the registry stored in `root_folder`
    pub async fn open(root_folder: &Path) -> Result<Self> {
        let pool = init_registry_pool(&root_folder.join(REGISTRY_FILE)).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a finished run; a run id can only be registered once
    pub async fn register_run(&self, manifest: &RunManifest, run_dir: &Path) -> Result<()> {
        let upstream = serde_json::to_string(&manifest.upstream_run_ids)?;
        let result = sqlx::query(
            r#"
            INSERT INTO runs (run_id, stage, run_dir, configuration_hash,
                              reproducibility_key, status, upstream_run_ids, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&manifest.run_id)
        .bind(manifest.stage.as_str())
        .bind(run_dir.to_string_lossy().to_string())
        .bind(&manifest.configuration_hash)
        .bind(&manifest.reproducibility_key)
        .bind(manifest.status.as_str())
        .bind(upstream)
        .bind(manifest.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(run_id = %manifest.run_id, "Run registered");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Err(
                Error::Precondition(format!("Run id {} is already registered", manifest.run_id)),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a run by id
    pub async fn lookup_run(&self, run_id: &str) -> Result<Option<RegistryEntry>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, stage, run_dir, configuration_hash, reproducibility_key,
                   status, upstream_run_ids, created_at
            FROM runs
            WHERE run_id = ?
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| entry_from_row(&row)).transpose()
    }

    /// All runs, optionally restricted to one stage, oldest first
    pub async fn list_runs(&self, stage: Option<Stage>) -> Result<Vec<RegistryEntry>> {
        let rows = match stage {
            Some(stage) => {
                sqlx::query(
                    r#"
                    SELECT run_id, stage, run_dir, configuration_hash, reproducibility_key,
                           status, upstream_run_ids, created_at
                    FROM runs
                    WHERE stage = ?
                    ORDER BY created_at, run_id
                    "#,
                )
                .bind(stage.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT run_id, stage, run_dir, configuration_hash, reproducibility_key,
                           status, upstream_run_ids, created_at
                    FROM runs
                    ORDER BY created_at, run_id
                    "#,
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(entry_from_row).collect()
    }
}

fn entry_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<RegistryEntry> {
    let stage_str: String = row.get("stage");
    let stage = Stage::parse(&stage_str)
        .ok_or_else(|| Error::Internal(format!("Unknown stage '{}' in registry", stage_str)))?;

    let upstream_str: String = row.get("upstream_run_ids");
    let upstream_run_ids: BTreeMap<String, String> = serde_json::from_str(&upstream_str)?;

    let created_str: String = row.get("created_at");
    let created_at = DateTime::parse_from_rfc3339(&created_str)
        .map_err(|e| Error::Internal(format!("Bad timestamp in registry: {}", e)))?
        .with_timezone(&Utc);

    let run_dir: String = row.get("run_dir");

    Ok(RegistryEntry {
        run_id: row.get("run_id"),
        stage,
        run_dir: PathBuf::from(run_dir),
        configuration_hash: row.get("configuration_hash"),
        reproducibility_key: row.get("reproducibility_key"),
        status: row.get("status"),
        upstream_run_ids,
        created_at,
    })
}
