//! Storage capability for durable jobs.
//!
//! The queue holds this capability, not a concrete backend: in-memory,
//! embedded SQLite, server Postgres, and file-backed stores all implement
//! the same operations. Every state transition goes through the store; it
//! is the single point of truth for job state.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::job::{ExecutionOutcome, Job, JobId};

/// Backend-specific persistence of jobs.
///
/// `next()` must be atomic: two concurrent calls never return the same job.
/// How that is obtained is the backend's business (a process-wide lock, an
/// `UPDATE .. RETURNING`, row locks with `SKIP LOCKED`).
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with [`StoreError::Duplicate`] if the id is
    /// already present.
    async fn add(&self, job: Job) -> Result<JobId, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Up to `n` pending jobs, ordered by `(run_after, created_at, id)`.
    async fn peek(&self, n: usize) -> Result<Vec<Job>, StoreError>;

    /// Atomically claim the earliest eligible pending job, transitioning it
    /// to `Processing`.
    async fn next(&self) -> Result<Option<Job>, StoreError>;

    async fn processing(&self) -> Result<Vec<Job>, StoreError>;

    async fn aborting(&self) -> Result<Vec<Job>, StoreError>;

    /// Apply an execution outcome (completion, failure, retry re-queue,
    /// skip) and return the updated job. Fails with
    /// [`StoreError::InvalidTransition`] when the job is already terminal.
    async fn complete(&self, id: JobId, outcome: &ExecutionOutcome) -> Result<Job, StoreError>;

    /// Request an abort. A `Processing` job moves to `Aborting` as a hint to
    /// its executor; a `Pending` job fails immediately since nothing holds
    /// it. Already-aborting jobs are returned unchanged.
    async fn abort(&self, id: JobId) -> Result<Job, StoreError>;

    async fn jobs_by_run_id(&self, run_id: &str) -> Result<Vec<Job>, StoreError>;

    /// Memoized output of any completed job matching `(task_type,
    /// fingerprint)`. When several match, the earliest-created wins, ties
    /// broken by smallest id, so the answer is stable within a process.
    async fn output_for_fingerprint(
        &self,
        task_type: &str,
        fingerprint: &str,
    ) -> Result<Option<Value>, StoreError>;

    /// Total number of stored jobs, any status.
    async fn size(&self) -> Result<usize, StoreError>;

    async fn delete_all(&self) -> Result<(), StoreError>;
}
