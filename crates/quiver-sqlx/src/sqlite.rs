//! Embedded single-file backend over SQLite.
//!
//! Claims go through one `UPDATE .. RETURNING` statement, which SQLite
//! executes atomically, so two concurrent `next()` calls can never return
//! the same row. Timestamps are stored as fixed-width RFC 3339 text, which
//! sorts chronologically.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use quiver_core::error::StoreError;
use quiver_core::job::{ExecutionOutcome, Job, JobId, JobStatus};
use quiver_core::limiter::RateLimitStore;
use quiver_core::store::JobStore;

const CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    queue_name   TEXT NOT NULL,
    run_id       TEXT,
    task_type    TEXT NOT NULL,
    input        TEXT NOT NULL,
    fingerprint  TEXT NOT NULL,
    status       TEXT NOT NULL,
    output       TEXT,
    error        TEXT,
    retries      INTEGER NOT NULL,
    max_retries  INTEGER NOT NULL,
    run_after    TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    deadline_at  TEXT
)
"#;

const CREATE_RATE_LIMIT: &str = r#"
CREATE TABLE IF NOT EXISTS job_queue_rate_limit (
    queue      TEXT NOT NULL,
    started_at TEXT NOT NULL
)
"#;

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_status_run_after ON jobs (status, run_after)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_run_id ON jobs (run_id)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_memo ON jobs (task_type, fingerprint, status)",
    "CREATE INDEX IF NOT EXISTS idx_rate_limit_queue_started ON job_queue_rate_limit (queue, started_at)",
];

fn db_err(error: sqlx::Error) -> StoreError {
    StoreError::backend(error)
}

fn encode_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn decode_time(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(StoreError::backend)
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let input: String = row.try_get("input").map_err(db_err)?;
    let output: Option<String> = row.try_get("output").map_err(db_err)?;
    let run_after: String = row.try_get("run_after").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
    let deadline_at: Option<String> = row.try_get("deadline_at").map_err(db_err)?;
    let retries: i64 = row.try_get("retries").map_err(db_err)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(db_err)?;

    Ok(Job {
        id: JobId::from_uuid(Uuid::parse_str(&id).map_err(StoreError::backend)?),
        queue_name: row.try_get("queue_name").map_err(db_err)?,
        run_id: row.try_get("run_id").map_err(db_err)?,
        task_type: row.try_get("task_type").map_err(db_err)?,
        input: serde_json::from_str(&input)?,
        fingerprint: row.try_get("fingerprint").map_err(db_err)?,
        status: status
            .parse::<JobStatus>()
            .map_err(StoreError::backend_msg)?,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error").map_err(db_err)?,
        retries: u32::try_from(retries).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        run_after: decode_time(&run_after)?,
        created_at: decode_time(&created_at)?,
        updated_at: decode_time(&updated_at)?,
        deadline_at: deadline_at.as_deref().map(decode_time).transpose()?,
    })
}

/// Job store over a single SQLite file (or `sqlite::memory:`), scoped to
/// one queue so several queues can share the file.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
    queue_name: String,
}

impl SqliteJobStore {
    /// Wrap an existing pool. Call [`SqliteJobStore::migrate`] once before
    /// first use.
    pub fn new(pool: SqlitePool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Open `url` and create the schema.
    pub async fn connect(url: &str, queue_name: impl Into<String>) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .map_err(db_err)?;
        let store = Self::new(pool, queue_name);
        store.migrate().await?;
        Ok(store)
    }

    /// Create the `jobs` and `job_queue_rate_limit` tables and their
    /// indexes if absent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_JOBS)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        sqlx::query(CREATE_RATE_LIMIT)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        for statement in CREATE_INDEXES {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue_name = ?1 AND status = ?2 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&self.queue_name)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    /// Write every mutable column of `job` inside the given executor.
    async fn update_job(
        tx: &mut sqlx::SqliteConnection,
        job: &Job,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET status = ?1, output = ?2, error = ?3, retries = ?4, \
             run_after = ?5, updated_at = ?6 WHERE id = ?7",
        )
        .bind(job.status.as_str())
        .bind(
            job.output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.error)
        .bind(i64::from(job.retries))
        .bind(encode_time(job.run_after))
        .bind(encode_time(job.updated_at))
        .bind(job.id.to_string())
        .execute(tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_for_update(
        tx: &mut sqlx::SqliteConnection,
        id: JobId,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(tx)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add(&self, job: Job) -> Result<JobId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, queue_name, run_id, task_type, input, fingerprint, \
             status, output, error, retries, max_retries, run_after, created_at, \
             updated_at, deadline_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        )
        .bind(job.id.to_string())
        .bind(&job.queue_name)
        .bind(&job.run_id)
        .bind(&job.task_type)
        .bind(serde_json::to_string(&job.input)?)
        .bind(&job.fingerprint)
        .bind(job.status.as_str())
        .bind(
            job.output
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(&job.error)
        .bind(i64::from(job.retries))
        .bind(i64::from(job.max_retries))
        .bind(encode_time(job.run_after))
        .bind(encode_time(job.created_at))
        .bind(encode_time(job.updated_at))
        .bind(job.deadline_at.map(encode_time))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(error)
                if error
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation()) =>
            {
                Err(StoreError::Duplicate(job.id))
            }
            Err(error) => Err(db_err(error)),
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn peek(&self, n: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue_name = ?1 AND status = 'pending' \
             ORDER BY run_after ASC, created_at ASC, id ASC LIMIT ?2",
        )
        .bind(&self.queue_name)
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let now = encode_time(Utc::now());
        let row = sqlx::query(
            "UPDATE jobs SET status = 'processing', updated_at = ?1 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue_name = ?2 AND status = 'pending' AND run_after <= ?1 \
                 ORDER BY run_after ASC, created_at ASC, id ASC \
                 LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(&now)
        .bind(&self.queue_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        self.jobs_with_status(JobStatus::Processing).await
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        self.jobs_with_status(JobStatus::Aborting).await
    }

    async fn complete(&self, id: JobId, outcome: &ExecutionOutcome) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = Self::load_for_update(&mut tx, id).await?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
            });
        }
        job.apply_outcome(outcome, Utc::now());
        Self::update_job(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn abort(&self, id: JobId) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = Self::load_for_update(&mut tx, id).await?;
        let now = Utc::now();
        match job.status {
            JobStatus::Processing => job.mark_aborting(now),
            JobStatus::Pending => job.mark_abort_failed(now),
            JobStatus::Aborting => {}
            _ => {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: job.status,
                });
            }
        }
        Self::update_job(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(job)
    }

    async fn jobs_by_run_id(&self, run_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue_name = ?1 AND run_id = ?2 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&self.queue_name)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn output_for_fingerprint(
        &self,
        task_type: &str,
        fingerprint: &str,
    ) -> Result<Option<Value>, StoreError> {
        let row = sqlx::query(
            "SELECT output FROM jobs \
             WHERE queue_name = ?1 AND task_type = ?2 AND fingerprint = ?3 \
             AND status = 'completed' \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(&self.queue_name)
        .bind(task_type)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => {
                let output: Option<String> = row.try_get("output").map_err(db_err)?;
                Ok(output.as_deref().map(serde_json::from_str).transpose()?)
            }
            None => Ok(None),
        }
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE queue_name = ?1")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE queue_name = ?1")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for SqliteJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_queue_rate_limit (queue, started_at) VALUES (?1, ?2)")
            .bind(queue)
            .bind(encode_time(at))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let rows = sqlx::query(
            "SELECT started_at FROM job_queue_rate_limit \
             WHERE queue = ?1 AND started_at >= ?2 ORDER BY started_at ASC",
        )
        .bind(queue)
        .bind(encode_time(since))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let at: String = row.try_get("started_at").map_err(db_err)?;
                decode_time(&at)
            })
            .collect()
    }

    async fn prune_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = ?1 AND started_at < ?2")
            .bind(queue)
            .bind(encode_time(cutoff))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = ?1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
