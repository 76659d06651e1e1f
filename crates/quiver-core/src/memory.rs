//! In-memory backend for tests, development, and ephemeral queues.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::job::{ExecutionOutcome, Job, JobId, JobStatus};
use crate::limiter::RateLimitStore;
use crate::store::JobStore;

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    rate_starts: HashMap<String, Vec<DateTime<Utc>>>,
}

/// Maps behind one async mutex; claim atomicity falls out of the lock.
///
/// Also keeps the rate-limit ledger, so a [`crate::limiter::StoredRateLimiter`]
/// can run against it in tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pending_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.run_after
        .cmp(&b.run_after)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, job: Job) -> Result<JobId, StoreError> {
        let mut state = self.state.lock().await;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }
        let id = job.id;
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn peek(&self, n: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(pending_order);
        pending.truncate(n);
        Ok(pending)
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let claimed = state
            .jobs
            .values()
            .filter(|job| job.is_eligible(now))
            .min_by(|a, b| pending_order(a, b))
            .map(|job| job.id);

        match claimed {
            Some(id) => {
                // Entry is present; we just looked it up under the lock.
                let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
                job.mark_processing(now);
                Ok(Some(job.clone()))
            }
            None => Ok(None),
        }
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing)
            .cloned()
            .collect())
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Aborting)
            .cloned()
            .collect())
    }

    async fn complete(&self, id: JobId, outcome: &ExecutionOutcome) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
            });
        }
        job.apply_outcome(outcome, Utc::now());
        Ok(job.clone())
    }

    async fn abort(&self, id: JobId) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
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
        Ok(job.clone())
    }

    async fn jobs_by_run_id(&self, run_id: &str) -> Result<Vec<Job>, StoreError> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|job| job.run_id.as_deref() == Some(run_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn output_for_fingerprint(
        &self,
        task_type: &str,
        fingerprint: &str,
    ) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .jobs
            .values()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.task_type == task_type
                    && job.fingerprint == fingerprint
            })
            .min_by_key(|job| (job.created_at, job.id))
            .and_then(|job| job.output.clone()))
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.len())
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.jobs.clear();
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for MemoryJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.rate_starts.entry(queue.to_string()).or_default().push(at);
        Ok(())
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        let mut starts: Vec<_> = state
            .rate_starts
            .get(queue)
            .map(|starts| starts.iter().copied().filter(|at| *at >= since).collect())
            .unwrap_or_default();
        starts.sort();
        Ok(starts)
    }

    async fn prune_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(starts) = state.rate_starts.get_mut(queue) {
            starts.retain(|at| *at >= cutoff);
        }
        Ok(())
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.rate_starts.remove(queue);
        Ok(())
    }
}
