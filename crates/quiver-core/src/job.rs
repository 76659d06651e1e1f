//! The durable job entity and its status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::fingerprint::fingerprint;

/// Unique job identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle states.
///
/// Transitions form a DAG: `Pending -> Processing -> {Completed | Failed |
/// Pending (retry) | Aborting -> Failed}`. A `Pending` job hit by an abort
/// goes straight to `Failed`, since no executor holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Aborting,
    Completed,
    Failed,
    Skipped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Skipped
        )
    }

    /// Text form used by the SQL backends.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Aborting => "aborting",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "aborting" => Ok(JobStatus::Aborting),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "skipped" => Ok(JobStatus::Skipped),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

/// Parameters for enqueueing a job. The queue assigns `id` and `run_id`
/// when absent and computes the fingerprint from `input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub id: Option<JobId>,
    pub task_type: String,
    pub input: Value,
    pub run_id: Option<String>,
    pub max_retries: u32,
    pub run_after: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    pub fn new(task_type: impl Into<String>, input: Value) -> Self {
        Self {
            id: None,
            task_type: task_type.into(),
            input,
            run_id: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            run_after: None,
            deadline_at: None,
        }
    }

    /// Supply the job id instead of having one assigned.
    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Earliest time the job becomes eligible to run.
    pub fn run_after(mut self, at: DateTime<Utc>) -> Self {
        self.run_after = Some(at);
        self
    }

    /// Absolute timeout; reaching it cancels the job like an abort.
    pub fn deadline_at(mut self, at: DateTime<Utc>) -> Self {
        self.deadline_at = Some(at);
        self
    }
}

/// Outcome of one execution attempt, as reported by the worker.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success(Value),
    Failure(JobError),
    /// No runner is registered for the job's task type.
    Skipped(String),
}

/// A durable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Grouping identifier shared by jobs submitted as one logical run.
    pub run_id: Option<String>,
    pub task_type: String,
    pub input: Value,
    /// Stable hash of `input`, used for result memoization.
    pub fingerprint: String,
    pub status: JobStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Assemble a pending job for `queue_name`, assigning any absent
    /// identifiers and fingerprinting the input.
    pub fn assemble(queue_name: impl Into<String>, new_job: NewJob) -> Self {
        let now = Utc::now();
        let fingerprint = fingerprint(&new_job.input);
        Self {
            id: new_job.id.unwrap_or_default(),
            queue_name: queue_name.into(),
            run_id: new_job.run_id.or_else(|| Some(Uuid::new_v4().to_string())),
            task_type: new_job.task_type,
            input: new_job.input,
            fingerprint,
            status: JobStatus::Pending,
            output: None,
            error: None,
            retries: 0,
            max_retries: new_job.max_retries,
            run_after: new_job.run_after.unwrap_or(now),
            created_at: now,
            updated_at: now,
            deadline_at: new_job.deadline_at,
        }
    }

    /// Whether `next()` may claim this job at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_after <= now
    }

    /// Claim transition.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.updated_at = now;
    }

    /// Hint the executor that an abort was requested.
    pub fn mark_aborting(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Aborting;
        self.updated_at = now;
    }

    /// Abort a job no executor holds; it fails immediately.
    pub fn mark_abort_failed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some("job aborted".to_string());
        self.updated_at = now;
    }

    /// Apply an execution outcome, driving the retry and abort policy.
    ///
    /// Success while the persisted status is `Aborting` still completes the
    /// job: persistence won the race. A retryable failure re-queues the job
    /// with `run_after` set to its retry date until the retry budget is
    /// exhausted, which forces `Failed`. `retries` never exceeds
    /// `max_retries`.
    pub fn apply_outcome(&mut self, outcome: &ExecutionOutcome, now: DateTime<Utc>) {
        self.updated_at = now;
        match outcome {
            ExecutionOutcome::Success(output) => {
                self.status = JobStatus::Completed;
                self.output = Some(output.clone());
                self.error = None;
            }
            ExecutionOutcome::Skipped(message) => {
                self.status = JobStatus::Skipped;
                self.error = Some(message.clone());
            }
            ExecutionOutcome::Failure(JobError::Retryable { message, retry_at }) => {
                if self.retries >= self.max_retries {
                    self.status = JobStatus::Failed;
                    self.error = Some(message.clone());
                } else {
                    self.retries += 1;
                    self.status = JobStatus::Pending;
                    self.run_after = *retry_at;
                    self.error = Some(message.clone());
                }
            }
            ExecutionOutcome::Failure(error) => {
                self.status = JobStatus::Failed;
                self.error = Some(error.message().to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn test_job(max_retries: u32) -> Job {
        Job::assemble(
            "test_queue",
            NewJob::new("task1", json!({"data": "input1"})).max_retries(max_retries),
        )
    }

    #[test]
    fn assemble_starts_pending_with_fingerprint() {
        let job = test_job(3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.fingerprint, fingerprint(&json!({"data": "input1"})));
        assert!(job.run_id.is_some());
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn assemble_keeps_caller_identifiers() {
        let id = JobId::new();
        let job = Job::assemble("q", NewJob::new("t", json!(1)).id(id).run_id("r1"));
        assert_eq!(job.id, id);
        assert_eq!(job.run_id.as_deref(), Some("r1"));
    }

    #[test]
    fn success_completes() {
        let mut job = test_job(3);
        job.mark_processing(Utc::now());
        job.apply_outcome(&ExecutionOutcome::Success(json!({"result": "ok"})), Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.output, Some(json!({"result": "ok"})));
        assert!(job.error.is_none());
    }

    #[test]
    fn success_wins_over_aborting() {
        let mut job = test_job(3);
        job.mark_processing(Utc::now());
        job.mark_aborting(Utc::now());
        job.apply_outcome(&ExecutionOutcome::Success(json!(1)), Utc::now());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn retryable_requeues_until_budget_exhausted() {
        let mut job = test_job(2);
        let retry_at = Utc::now() + Duration::seconds(5);

        for expected_retries in 1..=2 {
            job.mark_processing(Utc::now());
            job.apply_outcome(
                &ExecutionOutcome::Failure(JobError::retryable("flaky", retry_at)),
                Utc::now(),
            );
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.retries, expected_retries);
            assert_eq!(job.run_after, retry_at);
        }

        job.mark_processing(Utc::now());
        job.apply_outcome(
            &ExecutionOutcome::Failure(JobError::retryable("flaky", retry_at)),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, job.max_retries);
    }

    #[test]
    fn permanent_and_abort_are_terminal() {
        let mut job = test_job(5);
        job.mark_processing(Utc::now());
        job.apply_outcome(
            &ExecutionOutcome::Failure(JobError::permanent("bad input")),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 0);

        let mut job = test_job(5);
        job.mark_processing(Utc::now());
        job.apply_outcome(&ExecutionOutcome::Failure(JobError::aborted()), Utc::now());
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("job aborted"));
    }

    #[test]
    fn skip_is_terminal_with_reason() {
        let mut job = test_job(3);
        job.mark_processing(Utc::now());
        job.apply_outcome(
            &ExecutionOutcome::Skipped("no runner registered for task1".to_string()),
            Utc::now(),
        );
        assert_eq!(job.status, JobStatus::Skipped);
        assert!(job.status.is_terminal());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Aborting,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>(), Ok(status));
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }
}
