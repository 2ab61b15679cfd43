//! SQLite-backed job store.
//!
//! Each job is one row: indexed columns for the fields queries and the
//! conditional update need, plus the full record as a JSON document.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;

use super::{InsertOutcome, JobFilter, JobStore};
use crate::core::{Job, JobId};
use crate::errors::StoreError;

/// A durable [`JobStore`] in a SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Opens (creating if needed) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // every connection to :memory: is a separate database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// Wraps an existing pool, creating the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                job_type TEXT NOT NULL,
                request_key TEXT UNIQUE,
                created_at TEXT NOT NULL,
                body TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_job_type ON jobs(job_type);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn decode(body: &str) -> Result<Job, StoreError> {
        Ok(serde_json::from_str(body)?)
    }

    fn version(version: u64) -> Result<i64, StoreError> {
        i64::try_from(version).map_err(|_| StoreError::Serialization(format!("version {version} out of range")))
    }

    async fn fetch_one_by(&self, sql: &str, value: String) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| Self::decode(&row.try_get::<String, _>("body")?))
            .transpose()
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError> {
        let body = serde_json::to_string(&job)?;
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs (id, version, status, job_type, request_key, created_at, body)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(job.id.to_string())
        .bind(Self::version(job.version)?)
        .bind(job.status.as_str())
        .bind(&job.job_type)
        .bind(job.request_key.as_deref())
        .bind(crate::utils::format_rfc3339(&job.created_at))
        .bind(body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted(job));
        }

        let key = job.request_key.as_deref().unwrap_or_default();
        match self.find_by_request_key(key).await? {
            Some(existing) => Ok(InsertOutcome::Existing(existing)),
            None => Err(StoreError::Database(format!("job {} could not be inserted", job.id))),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.fetch_one_by("SELECT body FROM jobs WHERE id = ?1", id.to_string())
            .await
    }

    async fn compare_and_swap(&self, expected_version: u64, job: &Job) -> Result<bool, StoreError> {
        let body = serde_json::to_string(job)?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET version = ?1, status = ?2, body = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(Self::version(job.version)?)
        .bind(job.status.as_str())
        .bind(body)
        .bind(job.id.to_string())
        .bind(Self::version(expected_version)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let rows = match filter.status {
            Some(status) => {
                sqlx::query("SELECT body FROM jobs WHERE status = ?1 ORDER BY created_at, id")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT body FROM jobs ORDER BY created_at, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let job = Self::decode(&row.try_get::<String, _>("body")?)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }
        Ok(filter.finish(jobs))
    }

    async fn find_by_request_key(&self, request_key: &str) -> Result<Option<Job>, StoreError> {
        self.fetch_one_by("SELECT body FROM jobs WHERE request_key = ?1", request_key.to_string())
            .await
    }
}
