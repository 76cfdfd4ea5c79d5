//! Durable collaborators for the reconciliation engine: the district/month
//! snapshot cache and the job store.
//!
//! Both are narrow single-key interfaces. Cache writes are atomic per key
//! (temp file + rename); job saves use an optimistic revision check so a
//! cancellation request and an in-flight cycle can never silently clobber
//! each other.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mere_core::{DistrictSnapshot, JobStatus, ReconciliationJob, TargetMonth};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "mere-store";

/// Exponential backoff with a cap, shared by fetch retries and job-save
/// retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Single-key atomic snapshot cache. `set` either fully replaces the keyed
/// record or leaves the previous record visible; readers never observe a
/// partial write.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DistrictSnapshot>, CacheError>;
    async fn set(&self, key: &str, value: &DistrictSnapshot) -> Result<(), CacheError>;
}

/// File-backed cache, one JSON document per district/month key. Writes go
/// through a temp file and a rename so a crash mid-write leaves the old
/// record intact.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    root: PathBuf,
}

impl FileCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Injective key-to-filename encoding: alphanumerics and `-` pass
    /// through, every other byte (`_` included) becomes `_` plus two hex
    /// digits, so distinct keys can never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut encoded = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                encoded.push(byte as char);
            } else {
                encoded.push('_');
                encoded.push_str(&format!("{byte:02x}"));
            }
        }
        self.root.join(format!("{encoded}.json"))
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<DistrictSnapshot>, CacheError> {
        let path = self.path_for(key);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_str(&text)?))
    }

    async fn set(&self, key: &str, value: &DistrictSnapshot) -> Result<(), CacheError> {
        let path = self.path_for(key);
        fs::create_dir_all(&self.root).await?;

        let bytes = serde_json::to_vec_pretty(value)?;
        let temp_path = self.root.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        // Rename replaces any existing record in one step.
        if let Err(err) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err.into());
        }
        debug!(key, path = %path.display(), "cache record replaced");
        Ok(())
    }
}

/// In-memory cache for tests and fixture-driven runs.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    inner: RwLock<HashMap<String, DistrictSnapshot>>,
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<DistrictSnapshot>, CacheError> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &DistrictSnapshot) -> Result<(), CacheError> {
        self.inner.write().await.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("job {job_id} was modified concurrently (expected revision {expected})")]
    Conflict { job_id: Uuid, expected: u64 },
    #[error("job store backend: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("job serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Durable job persistence. Records survive restarts; `list_active` is the
/// recovery path a restarted scheduler uses to resume ticking. `save`
/// enforces a revision check: the caller's copy must match the stored
/// revision, and the revision is bumped on success.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>, JobStoreError>;
    async fn save(&self, job: &mut ReconciliationJob) -> Result<(), JobStoreError>;
    async fn list_active(&self) -> Result<Vec<ReconciliationJob>, JobStoreError>;
    async fn find_for_month(
        &self,
        district_id: &str,
        month: TargetMonth,
    ) -> Result<Option<ReconciliationJob>, JobStoreError>;
}

/// In-memory job store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<HashMap<Uuid, ReconciliationJob>>,
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>, JobStoreError> {
        Ok(self.inner.read().await.get(&job_id).cloned())
    }

    async fn save(&self, job: &mut ReconciliationJob) -> Result<(), JobStoreError> {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(&job.id) {
            if existing.revision != job.revision {
                return Err(JobStoreError::Conflict {
                    job_id: job.id,
                    expected: job.revision,
                });
            }
        } else if job.revision != 0 {
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected: job.revision,
            });
        }
        job.revision += 1;
        map.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ReconciliationJob>, JobStoreError> {
        let mut jobs: Vec<_> = self
            .inner
            .read()
            .await
            .values()
            .filter(|j| j.status == JobStatus::Active)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.start_date, j.district_id.clone()));
        Ok(jobs)
    }

    async fn find_for_month(
        &self,
        district_id: &str,
        month: TargetMonth,
    ) -> Result<Option<ReconciliationJob>, JobStoreError> {
        Ok(self
            .inner
            .read()
            .await
            .values()
            .filter(|j| j.district_id == district_id && j.target_month == month)
            .max_by_key(|j| j.start_date)
            .cloned())
    }
}

/// Postgres-backed job store. The full job (config snapshot and timeline
/// included) lives in a JSONB column; the indexed columns exist only for
/// lookup and the revision check.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS reconciliation_jobs (
    id UUID PRIMARY KEY,
    district_id TEXT NOT NULL,
    target_month TEXT NOT NULL,
    status TEXT NOT NULL,
    revision BIGINT NOT NULL,
    data JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS reconciliation_jobs_month_idx
    ON reconciliation_jobs (district_id, target_month);
CREATE INDEX IF NOT EXISTS reconciliation_jobs_status_idx
    ON reconciliation_jobs (status);
"#;

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA_SQL.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ReconciliationJob, JobStoreError> {
        let data: serde_json::Value = row.try_get("data")?;
        Ok(serde_json::from_value(data)?)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn load(&self, job_id: Uuid) -> Result<Option<ReconciliationJob>, JobStoreError> {
        let row = sqlx::query("SELECT data FROM reconciliation_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }

    async fn save(&self, job: &mut ReconciliationJob) -> Result<(), JobStoreError> {
        let next_revision = job.revision + 1;
        let mut stored = job.clone();
        stored.revision = next_revision;
        let data = serde_json::to_value(&stored)?;

        let rows = if job.revision == 0 {
            sqlx::query(
                r#"
                INSERT INTO reconciliation_jobs (id, district_id, target_month, status, revision, data)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(job.id)
            .bind(&job.district_id)
            .bind(job.target_month.to_string())
            .bind(job.status.to_string())
            .bind(next_revision as i64)
            .bind(&data)
            .execute(&self.pool)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE reconciliation_jobs
                   SET status = $1,
                       revision = $2,
                       data = $3,
                       updated_at = NOW()
                 WHERE id = $4
                   AND revision = $5
                "#,
            )
            .bind(job.status.to_string())
            .bind(next_revision as i64)
            .bind(&data)
            .bind(job.id)
            .bind(job.revision as i64)
            .execute(&self.pool)
            .await?
            .rows_affected()
        };

        if rows == 0 {
            return Err(JobStoreError::Conflict {
                job_id: job.id,
                expected: job.revision,
            });
        }
        job.revision = next_revision;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<ReconciliationJob>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT data FROM reconciliation_jobs
             WHERE status = 'active'
             ORDER BY updated_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn find_for_month(
        &self,
        district_id: &str,
        month: TargetMonth,
    ) -> Result<Option<ReconciliationJob>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT data FROM reconciliation_jobs
             WHERE district_id = $1
               AND target_month = $2
             ORDER BY updated_at DESC
             LIMIT 1
            "#,
        )
        .bind(district_id)
        .bind(month.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::job_from_row).transpose()
    }
}
