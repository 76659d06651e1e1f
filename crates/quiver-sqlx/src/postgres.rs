//! Server backend over PostgreSQL.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` in the selecting subquery, so
//! concurrent workers on separate connections contend on nothing and never
//! receive the same row. Payloads live in `jsonb`, timestamps in
//! `timestamptz`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use tracing::debug;
use uuid::Uuid;

use quiver_core::error::StoreError;
use quiver_core::job::{ExecutionOutcome, Job, JobId, JobStatus};
use quiver_core::limiter::RateLimitStore;
use quiver_core::store::JobStore;

const CREATE_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           UUID PRIMARY KEY,
    queue_name   TEXT NOT NULL,
    run_id       TEXT,
    task_type    TEXT NOT NULL,
    input        JSONB NOT NULL,
    fingerprint  TEXT NOT NULL,
    status       TEXT NOT NULL,
    output       JSONB,
    error        TEXT,
    retries      INTEGER NOT NULL,
    max_retries  INTEGER NOT NULL,
    run_after    TIMESTAMPTZ NOT NULL,
    created_at   TIMESTAMPTZ NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL,
    deadline_at  TIMESTAMPTZ
)
"#;

const CREATE_RATE_LIMIT: &str = r#"
CREATE TABLE IF NOT EXISTS job_queue_rate_limit (
    queue      TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL
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

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: Uuid = row.try_get("id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let retries: i32 = row.try_get("retries").map_err(db_err)?;
    let max_retries: i32 = row.try_get("max_retries").map_err(db_err)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        queue_name: row.try_get("queue_name").map_err(db_err)?,
        run_id: row.try_get("run_id").map_err(db_err)?,
        task_type: row.try_get("task_type").map_err(db_err)?,
        input: row.try_get("input").map_err(db_err)?,
        fingerprint: row.try_get("fingerprint").map_err(db_err)?,
        status: status
            .parse::<JobStatus>()
            .map_err(StoreError::backend_msg)?,
        output: row.try_get("output").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        retries: u32::try_from(retries).unwrap_or(0),
        max_retries: u32::try_from(max_retries).unwrap_or(0),
        run_after: row.try_get("run_after").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        deadline_at: row.try_get("deadline_at").map_err(db_err)?,
    })
}

fn clamp_retries(retries: u32) -> i32 {
    i32::try_from(retries).unwrap_or(i32::MAX)
}

/// Job store over a shared PostgreSQL database, scoped to one queue.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
    queue_name: String,
}

impl PgJobStore {
    /// Wrap an existing pool. Call [`PgJobStore::migrate`] once before
    /// first use.
    pub fn new(pool: PgPool, queue_name: impl Into<String>) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
        }
    }

    /// Connect to `url` and create the schema.
    pub async fn connect(url: &str, queue_name: impl Into<String>) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(db_err)?;
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
        debug!(queue = %self.queue_name, "postgres job store migrated");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue_name = $1 AND status = $2 \
             ORDER BY created_at ASC, id ASC",
        )
        .bind(&self.queue_name)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_job(tx: &mut sqlx::PgConnection, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE jobs SET status = $1, output = $2, error = $3, retries = $4, \
             run_after = $5, updated_at = $6 WHERE id = $7",
        )
        .bind(job.status.as_str())
        .bind(&job.output)
        .bind(&job.error)
        .bind(clamp_retries(job.retries))
        .bind(job.run_after)
        .bind(job.updated_at)
        .bind(job.id.0)
        .execute(tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Load the row with a row lock so the transition below is race-free.
    async fn load_for_update(
        tx: &mut sqlx::PgConnection,
        id: JobId,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id.0)
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
impl JobStore for PgJobStore {
    async fn add(&self, job: Job) -> Result<JobId, StoreError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, queue_name, run_id, task_type, input, fingerprint, \
             status, output, error, retries, max_retries, run_after, created_at, \
             updated_at, deadline_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(job.id.0)
        .bind(&job.queue_name)
        .bind(&job.run_id)
        .bind(&job.task_type)
        .bind(&job.input)
        .bind(&job.fingerprint)
        .bind(job.status.as_str())
        .bind(&job.output)
        .bind(&job.error)
        .bind(clamp_retries(job.retries))
        .bind(clamp_retries(job.max_retries))
        .bind(job.run_after)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.deadline_at)
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
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn peek(&self, n: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE queue_name = $1 AND status = 'pending' \
             ORDER BY run_after ASC, created_at ASC, id ASC LIMIT $2",
        )
        .bind(&self.queue_name)
        .bind(i64::try_from(n).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(
            "UPDATE jobs SET status = 'processing', updated_at = now() \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE queue_name = $1 AND status = 'pending' AND run_after <= now() \
                 ORDER BY run_after ASC, created_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING *",
        )
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
            "SELECT * FROM jobs WHERE queue_name = $1 AND run_id = $2 \
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
             WHERE queue_name = $1 AND task_type = $2 AND fingerprint = $3 \
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
            Some(row) => Ok(row.try_get("output").map_err(db_err)?),
            None => Ok(None),
        }
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs WHERE queue_name = $1")
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        let n: i64 = row.try_get("n").map_err(db_err)?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM jobs WHERE queue_name = $1")
            .bind(&self.queue_name)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for PgJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO job_queue_rate_limit (queue, started_at) VALUES ($1, $2)")
            .bind(queue)
            .bind(at)
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
             WHERE queue = $1 AND started_at >= $2 ORDER BY started_at ASC",
        )
        .bind(queue)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| row.try_get("started_at").map_err(db_err))
            .collect()
    }

    async fn prune_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = $1 AND started_at < $2")
            .bind(queue)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM job_queue_rate_limit WHERE queue = $1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
