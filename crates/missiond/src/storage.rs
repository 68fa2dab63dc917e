//! SQLite storage module for the orchestrator.
//!
//! Persists checkpoint snapshots and finished-mission history. Missions and
//! snapshots are stored as JSON blobs; callers treat the format as opaque.

use chrono::Utc;
use mission_core::{CheckpointSnapshot, Id, Mission};
use sha2::{Digest, Sha256};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to create database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint checksum mismatch for mission {0}")]
    ChecksumMismatch(String),
    #[error("mission not found: {0}")]
    MissionNotFound(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage backend for the orchestrator.
#[derive(Debug)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    /// Create a new storage instance with the given database path.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            // Remove comment lines before splitting.
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    /// Close the connection pool. Subsequent operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // --- Checkpoint operations ---

    /// Upsert the latest checkpoint for a mission.
    pub async fn save_checkpoint(&self, snapshot: &CheckpointSnapshot) -> Result<()> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let checksum = checksum(&snapshot_json);

        sqlx::query(
            r#"
            INSERT INTO checkpoints (mission_id, phase_order, step_order, snapshot_json, checksum, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(mission_id) DO UPDATE SET
                phase_order = excluded.phase_order,
                step_order = excluded.step_order,
                snapshot_json = excluded.snapshot_json,
                checksum = excluded.checksum,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(snapshot.mission_id.as_ref())
        .bind(i64::from(snapshot.phase_order))
        .bind(i64::from(snapshot.step_order))
        .bind(&snapshot_json)
        .bind(&checksum)
        .bind(snapshot.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the latest checkpoint for a mission, verifying its checksum.
    pub async fn load_checkpoint(&self, mission_id: &Id) -> Result<Option<CheckpointSnapshot>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT snapshot_json, checksum FROM checkpoints WHERE mission_id = ?1",
        )
        .bind(mission_id.as_ref())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        if checksum(&row.snapshot_json) != row.checksum {
            return Err(StorageError::ChecksumMismatch(mission_id.to_string()));
        }

        Ok(Some(serde_json::from_str(&row.snapshot_json)?))
    }

    // --- History operations ---

    /// Append a finished mission to history, replacing any earlier record of
    /// the same mission, then trim to `limit` entries.
    pub async fn append_to_history(&self, mission: &Mission, limit: usize) -> Result<()> {
        let mission_json = serde_json::to_string(mission)?;
        let finished_at = mission.completed_at.unwrap_or_else(Utc::now);

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO mission_history (id, goal, status, mission_json, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(mission.id.as_ref())
        .bind(&mission.goal)
        .bind(mission.status.as_str())
        .bind(&mission_json)
        .bind(finished_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM mission_history WHERE id NOT IN (
                SELECT id FROM mission_history ORDER BY finished_at DESC, rowid DESC LIMIT ?1
            )
            "#,
        )
        .bind(limit as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load up to `limit` finished missions, most recent first.
    pub async fn load_history(&self, limit: usize) -> Result<Vec<Mission>> {
        let rows = sqlx::query_as::<_, HistoryRow>(
            "SELECT mission_json FROM mission_history ORDER BY finished_at DESC, rowid DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| serde_json::from_str(&r.mission_json).map_err(StorageError::from))
            .collect()
    }

    /// Get a finished mission by ID.
    pub async fn get_history_mission(&self, id: &Id) -> Result<Mission> {
        let row = sqlx::query_as::<_, HistoryRow>(
            "SELECT mission_json FROM mission_history WHERE id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::MissionNotFound(id.to_string()))?;

        Ok(serde_json::from_str(&row.mission_json)?)
    }
}

/// SHA-256 hex digest of a checkpoint blob.
fn checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// --- Row types for SQLx ---

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    snapshot_json: String,
    checksum: String,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    mission_json: String,
}
