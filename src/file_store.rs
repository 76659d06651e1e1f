//! File-backed local job store.
//!
//! One JSON document per job under `<root>/jobs/`, plus a per-queue ledger
//! document under `<root>/rate/`. A store-wide async lock gives every
//! read-modify-write the single-transaction semantics the claim needs; this
//! store trades throughput for having no dependencies beyond a writable
//! directory, which suits desktop and dev profiles.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use quiver_core::error::StoreError;
use quiver_core::job::{ExecutionOutcome, Job, JobId, JobStatus};
use quiver_core::limiter::RateLimitStore;
use quiver_core::store::JobStore;

fn io_err(error: std::io::Error) -> StoreError {
    StoreError::backend(error)
}

fn pending_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.run_after
        .cmp(&b.run_after)
        .then(a.created_at.cmp(&b.created_at))
        .then(a.id.cmp(&b.id))
}

/// Job store over a directory of JSON documents.
pub struct FileJobStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileJobStore {
    /// Open (and if needed create) the store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("jobs")).await.map_err(io_err)?;
        fs::create_dir_all(root.join("rate")).await.map_err(io_err)?;
        debug!(root = %root.display(), "file job store opened");
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn job_path(&self, id: JobId) -> PathBuf {
        self.jobs_dir().join(format!("{id}.json"))
    }

    fn ledger_path(&self, queue: &str) -> PathBuf {
        let sanitized: String = queue
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join("rate").join(format!("{sanitized}.json"))
    }

    async fn read_job(&self, path: &Path) -> Result<Option<Job>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_err(error)),
        }
    }

    async fn write_job(&self, job: &Job) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(job)?;
        fs::write(self.job_path(job.id), content)
            .await
            .map_err(io_err)
    }

    /// Scan every job document. Unreadable files are logged and skipped so
    /// one corrupt document cannot wedge the queue.
    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(self.jobs_dir()).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path).await {
                Ok(content) => match serde_json::from_str::<Job>(&content) {
                    Ok(job) => jobs.push(job),
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "failed to deserialize job file");
                    }
                },
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to read job file");
                }
            }
        }
        Ok(jobs)
    }

    async fn read_ledger(&self, queue: &str) -> Result<Vec<DateTime<Utc>>, StoreError> {
        match fs::read_to_string(self.ledger_path(queue)).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(error) => Err(io_err(error)),
        }
    }

    async fn write_ledger(
        &self,
        queue: &str,
        starts: &[DateTime<Utc>],
    ) -> Result<(), StoreError> {
        let content = serde_json::to_string(starts)?;
        fs::write(self.ledger_path(queue), content)
            .await
            .map_err(io_err)
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn add(&self, job: Job) -> Result<JobId, StoreError> {
        let _guard = self.lock.lock().await;
        if self.read_job(&self.job_path(job.id)).await?.is_some() {
            return Err(StoreError::Duplicate(job.id));
        }
        let id = job.id;
        self.write_job(&job).await?;
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        self.read_job(&self.job_path(id)).await
    }

    async fn peek(&self, n: usize) -> Result<Vec<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut pending: Vec<_> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by(pending_order);
        pending.truncate(n);
        Ok(pending)
    }

    async fn next(&self) -> Result<Option<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        let now = Utc::now();
        let claimed = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| job.is_eligible(now))
            .min_by(pending_order);

        match claimed {
            Some(mut job) => {
                job.mark_processing(now);
                self.write_job(&job).await?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn processing(&self) -> Result<Vec<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Processing)
            .collect())
    }

    async fn aborting(&self) -> Result<Vec<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| job.status == JobStatus::Aborting)
            .collect())
    }

    async fn complete(&self, id: JobId, outcome: &ExecutionOutcome) -> Result<Job, StoreError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .read_job(&self.job_path(id))
            .await?
            .ok_or(StoreError::NotFound(id))?;
        if job.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                id,
                from: job.status,
            });
        }
        job.apply_outcome(outcome, Utc::now());
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn abort(&self, id: JobId) -> Result<Job, StoreError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .read_job(&self.job_path(id))
            .await?
            .ok_or(StoreError::NotFound(id))?;
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
        self.write_job(&job).await?;
        Ok(job)
    }

    async fn jobs_by_run_id(&self, run_id: &str) -> Result<Vec<Job>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut jobs: Vec<_> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| job.run_id.as_deref() == Some(run_id))
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn output_for_fingerprint(
        &self,
        task_type: &str,
        fingerprint: &str,
    ) -> Result<Option<Value>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|job| {
                job.status == JobStatus::Completed
                    && job.task_type == task_type
                    && job.fingerprint == fingerprint
            })
            .min_by_key(|job| (job.created_at, job.id))
            .and_then(|job| job.output))
    }

    async fn size(&self) -> Result<usize, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load_all().await?.len())
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = fs::read_dir(self.jobs_dir()).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            fs::remove_file(entry.path()).await.map_err(io_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStore for FileJobStore {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut starts = self.read_ledger(queue).await?;
        starts.push(at);
        self.write_ledger(queue, &starts).await
    }

    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut starts: Vec<_> = self
            .read_ledger(queue)
            .await?
            .into_iter()
            .filter(|at| *at >= since)
            .collect();
        starts.sort();
        Ok(starts)
    }

    async fn prune_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut starts = self.read_ledger(queue).await?;
        starts.retain(|at| *at >= cutoff);
        self.write_ledger(queue, &starts).await
    }

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        match fs::remove_file(self.ledger_path(queue)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(io_err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_core::fingerprint::fingerprint;
    use quiver_core::job::NewJob;
    use serde_json::json;
    use tempfile::TempDir;

    fn job(task_type: &str, input: Value) -> Job {
        Job::assemble("file_queue", NewJob::new(task_type, input))
    }

    #[tokio::test]
    async fn add_claim_complete_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let id = store
            .add(job("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        assert_eq!(store.size().await.unwrap(), 1);

        let claimed = store.next().await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(store.next().await.unwrap().is_none());

        store
            .complete(id, &ExecutionOutcome::Success(json!({"result": "success"})))
            .await
            .unwrap();
        let memoized = store
            .output_for_fingerprint("task1", &fingerprint(&json!({"data": "input1"})))
            .await
            .unwrap();
        assert_eq!(memoized, Some(json!({"result": "success"})));
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        let j = job("task1", json!(1));
        store.add(j.clone()).await.unwrap();
        assert!(matches!(
            store.add(j).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let store = FileJobStore::open(dir.path()).await.unwrap();
            id = store
                .add(job("task1", json!({"data": "input1"})))
                .await
                .unwrap();
            store.record_start("file_queue", Utc::now()).await.unwrap();
        }

        let reopened = FileJobStore::open(dir.path()).await.unwrap();
        let loaded = reopened.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert_eq!(
            reopened
                .starts_since("file_queue", Utc::now() - chrono::Duration::seconds(10))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn claim_order_is_fifo() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();

        let mut a = job("task1", json!("a"));
        let mut b = job("task1", json!("b"));
        let base = Utc::now() - chrono::Duration::seconds(10);
        a.created_at = base;
        a.run_after = base;
        b.created_at = base + chrono::Duration::seconds(1);
        b.run_after = base;
        store.add(a.clone()).await.unwrap();
        store.add(b.clone()).await.unwrap();

        assert_eq!(store.next().await.unwrap().unwrap().id, a.id);
        assert_eq!(store.next().await.unwrap().unwrap().id, b.id);
    }

    #[tokio::test]
    async fn corrupt_document_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        store.add(job("task1", json!(1))).await.unwrap();

        tokio::fs::write(dir.path().join("jobs/garbage.json"), b"not json")
            .await
            .unwrap();

        assert_eq!(store.size().await.unwrap(), 1);
        assert!(store.next().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_all_empties_store() {
        let dir = TempDir::new().unwrap();
        let store = FileJobStore::open(dir.path()).await.unwrap();
        for i in 0..3 {
            store.add(job("task1", json!(i))).await.unwrap();
        }
        store.delete_all().await.unwrap();
        assert_eq!(store.size().await.unwrap(), 0);
    }
}
