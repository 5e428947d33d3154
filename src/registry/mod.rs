// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Job Registry: the durable, exclusive owner of [`Job`] rows and the
//! [`ScanCursor`] bookmarks. Backed by SQLite (crash-log, not a relational
//! model — no foreign keys between `jobs` and `scan_cursor`).

use crate::model::{Job, JobStatus, ScanCursor};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), RegistryError>;
    async fn update_container_name(&self, uuid: &str, name: &str) -> Result<(), RegistryError>;
    async fn update_message(&self, uuid: &str, message: &str) -> Result<(), RegistryError>;
    async fn update_status(&self, uuid: &str, status: JobStatus) -> Result<(), RegistryError>;
    /// Gated on `block_number > job.last_block_number` so re-processing the
    /// same event (e.g. after a crash mid-batch) never double-counts reward.
    async fn update_reward_and_block(
        &self,
        uuid: &str,
        block_number: i64,
        new_reward: f64,
    ) -> Result<(), RegistryError>;
    async fn delete(&self, uuid: &str) -> Result<(), RegistryError>;
    async fn get(&self, uuid: &str) -> Result<Option<Job>, RegistryError>;
    async fn list(&self) -> Result<Vec<Job>, RegistryError>;

    /// Every GPU index currently reserved by a live (non-removed) job.
    async fn reserved_gpu_indices(&self) -> Result<Vec<String>, RegistryError>;

    async fn load_cursor(&self, scanner_id: i64, genesis_block: i64)
        -> Result<ScanCursor, RegistryError>;
    async fn save_cursor(&self, scanner_id: i64, last_block: i64) -> Result<(), RegistryError>;
}

/// SQLite-backed [`JobRegistry`]. `rusqlite::Connection` is not `Sync`, so
/// all access is serialized behind a blocking mutex; critical sections are
/// single prepared-statement executions and stay well under a millisecond.
pub struct SqliteJobRegistry {
    conn: Mutex<Connection>,
}

impl SqliteJobRegistry {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), RegistryError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA busy_timeout=5000;

             CREATE TABLE IF NOT EXISTS jobs (
                 uuid                TEXT PRIMARY KEY,
                 name                TEXT NOT NULL,
                 image               TEXT NOT NULL,
                 env_json            TEXT NOT NULL,
                 resource_json       TEXT NOT NULL,
                 container_name      TEXT NOT NULL DEFAULT '',
                 status              TEXT NOT NULL,
                 message             TEXT NOT NULL DEFAULT '',
                 reward              REAL NOT NULL DEFAULT 0,
                 last_block_number   INTEGER NOT NULL DEFAULT 0,
                 reserved_gpu_json   TEXT NOT NULL DEFAULT '[]',
                 create_time         INTEGER NOT NULL
             );

             CREATE TABLE IF NOT EXISTS scan_cursor (
                 scanner_id  INTEGER PRIMARY KEY,
                 last_block  INTEGER NOT NULL,
                 updated_at  INTEGER NOT NULL
             );",
        )?;
        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let env_json: String = row.get("env_json")?;
        let resource_json: String = row.get("resource_json")?;
        let reserved_gpu_json: String = row.get("reserved_gpu_json")?;
        let status_str: String = row.get("status")?;

        Ok(Job {
            uuid: row.get("uuid")?,
            name: row.get("name")?,
            image: row.get("image")?,
            env: serde_json::from_str(&env_json).unwrap_or_default(),
            resource: serde_json::from_str(&resource_json).unwrap_or_default(),
            container_name: row.get("container_name")?,
            status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Failed),
            message: row.get("message")?,
            reward: row.get("reward")?,
            last_block_number: row.get("last_block_number")?,
            reserved_gpu_indices: serde_json::from_str(&reserved_gpu_json).unwrap_or_default(),
            create_time: row.get("create_time")?,
        })
    }
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn insert(&self, job: Job) -> Result<(), RegistryError> {
        let env_json = serde_json::to_string(&job.env)?;
        let resource_json = serde_json::to_string(&job.resource)?;
        let reserved_gpu_json = serde_json::to_string(&job.reserved_gpu_indices)?;

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO jobs (
                uuid, name, image, env_json, resource_json, container_name,
                status, message, reward, last_block_number, reserved_gpu_json, create_time
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                job.uuid,
                job.name,
                job.image,
                env_json,
                resource_json,
                job.container_name,
                job.status.as_str(),
                job.message,
                job.reward,
                job.last_block_number,
                reserved_gpu_json,
                job.create_time,
            ],
        )?;
        Ok(())
    }

    async fn update_container_name(&self, uuid: &str, name: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET container_name = ?1, status = ?2 WHERE uuid = ?3",
            params![name, JobStatus::Running.as_str(), uuid],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    async fn update_message(&self, uuid: &str, message: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET message = ?1, status = ?2 WHERE uuid = ?3",
            params![message, JobStatus::Failed.as_str(), uuid],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    async fn update_status(&self, uuid: &str, status: JobStatus) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = ?1 WHERE uuid = ?2",
            params![status.as_str(), uuid],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    async fn update_reward_and_block(
        &self,
        uuid: &str,
        block_number: i64,
        new_reward: f64,
    ) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET reward = ?1, last_block_number = ?2
             WHERE uuid = ?3 AND ?2 > last_block_number",
            params![new_reward, block_number, uuid],
        )?;
        if changed == 0 {
            // Either the job doesn't exist, or this block was already
            // processed (idempotent no-op) — verify which.
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM jobs WHERE uuid = ?1",
                    params![uuid],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(RegistryError::NotFound(uuid.to_string()));
            }
        }
        Ok(())
    }

    async fn delete(&self, uuid: &str) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM jobs WHERE uuid = ?1", params![uuid])?;
        Ok(())
    }

    async fn get(&self, uuid: &str) -> Result<Option<Job>, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row("SELECT * FROM jobs WHERE uuid = ?1", params![uuid], |row| {
                Self::row_to_job(row)
            })
            .optional()?;
        Ok(job)
    }

    async fn list(&self) -> Result<Vec<Job>, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY create_time")?;
        let jobs = stmt
            .query_map([], |row| Self::row_to_job(row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    async fn reserved_gpu_indices(&self) -> Result<Vec<String>, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT reserved_gpu_json FROM jobs WHERE status != ?1",
        )?;
        let rows = stmt.query_map(params![JobStatus::Removed.as_str()], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;

        let mut indices = Vec::new();
        for row in rows {
            let json = row?;
            let these: Vec<String> = serde_json::from_str(&json)?;
            indices.extend(these);
        }
        Ok(indices)
    }

    async fn load_cursor(
        &self,
        scanner_id: i64,
        genesis_block: i64,
    ) -> Result<ScanCursor, RegistryError> {
        let conn = self.conn.lock().unwrap();
        let cursor = conn
            .query_row(
                "SELECT scanner_id, last_block, updated_at FROM scan_cursor WHERE scanner_id = ?1",
                params![scanner_id],
                |row| {
                    Ok(ScanCursor {
                        scanner_id: row.get(0)?,
                        last_block: row.get(1)?,
                        updated_at: row.get(2)?,
                    })
                },
            )
            .optional()?;

        Ok(cursor.unwrap_or(ScanCursor {
            scanner_id,
            last_block: genesis_block,
            updated_at: 0,
        }))
    }

    async fn save_cursor(&self, scanner_id: i64, last_block: i64) -> Result<(), RegistryError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO scan_cursor (scanner_id, last_block, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(scanner_id) DO UPDATE SET
                last_block = MAX(scan_cursor.last_block, excluded.last_block),
                updated_at = excluded.updated_at",
            params![scanner_id, last_block, now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HardwareResource;

    fn sample_job(uuid: &str) -> Job {
        Job::new(
            uuid.to_string(),
            "my-job".to_string(),
            "alpine:latest".to_string(),
            vec!["FOO=bar".to_string()],
            HardwareResource {
                cpu: 2,
                memory: 1 << 30,
                storage: 1 << 30,
                gpu: 0,
                gpu_model: String::new(),
            },
            vec![],
            1_700_000_000,
        )
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        registry.insert(sample_job("job-1")).await.unwrap();
        let job = registry.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.name, "my-job");
        assert_eq!(job.status, JobStatus::Created);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        assert!(registry.get("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_container_name_transitions_to_running() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        registry.insert(sample_job("job-1")).await.unwrap();
        registry
            .update_container_name("job-1", "my-job-ab12c")
            .await
            .unwrap();
        let job = registry.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.container_name, "my-job-ab12c");
        assert_eq!(job.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn reward_update_is_idempotent_per_block() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        registry.insert(sample_job("job-1")).await.unwrap();

        registry
            .update_reward_and_block("job-1", 100, 1.0)
            .await
            .unwrap();
        // Re-processing the same block (simulated crash-recovery replay)
        // must not double the reward.
        registry
            .update_reward_and_block("job-1", 100, 1.0)
            .await
            .unwrap();

        let job = registry.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.reward, 1.0);
        assert_eq!(job.last_block_number, 100);

        registry
            .update_reward_and_block("job-1", 150, 3.0)
            .await
            .unwrap();
        let job = registry.get("job-1").await.unwrap().unwrap();
        assert_eq!(job.reward, 3.0);
        assert_eq!(job.last_block_number, 150);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        registry.insert(sample_job("job-1")).await.unwrap();
        registry.delete("job-1").await.unwrap();
        registry.delete("job-1").await.unwrap();
        assert!(registry.get("job-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserved_gpu_indices_excludes_removed_jobs() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        let mut job = sample_job("job-1");
        job.reserved_gpu_indices = vec!["0".to_string(), "1".to_string()];
        registry.insert(job).await.unwrap();

        let mut job2 = sample_job("job-2");
        job2.reserved_gpu_indices = vec!["2".to_string()];
        job2.status = JobStatus::Removed;
        registry.insert(job2).await.unwrap();

        let mut indices = registry.reserved_gpu_indices().await.unwrap();
        indices.sort();
        assert_eq!(indices, vec!["0".to_string(), "1".to_string()]);
    }

    #[tokio::test]
    async fn cursor_defaults_to_genesis_then_persists() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        let cursor = registry.load_cursor(1, 500).await.unwrap();
        assert_eq!(cursor.last_block, 500);

        registry.save_cursor(1, 600).await.unwrap();
        let cursor = registry.load_cursor(1, 500).await.unwrap();
        assert_eq!(cursor.last_block, 600);
    }

    #[tokio::test]
    async fn cursor_is_monotone_non_decreasing() {
        let registry = SqliteJobRegistry::open_in_memory().unwrap();
        registry.save_cursor(1, 1000).await.unwrap();
        // An out-of-order save (e.g. a retried tick) must not roll the
        // cursor backwards.
        registry.save_cursor(1, 900).await.unwrap();
        let cursor = registry.load_cursor(1, 0).await.unwrap();
        assert_eq!(cursor.last_block, 1000);
    }
}
