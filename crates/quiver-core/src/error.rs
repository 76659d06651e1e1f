//! Error taxonomy shared by runners, stores, and the scheduler.

use chrono::{DateTime, Utc};

use crate::job::{JobId, JobStatus};

/// Failure a job runner reports from `run`.
///
/// The scheduler classifies these into state transitions; they never unwind
/// the scheduling loop. Anything a runner cannot name maps to [`JobError::Permanent`],
/// since an unclassified error indicates a programming fault rather than a
/// transient condition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    /// Execution observed the cancellation signal.
    #[error("job aborted: {0}")]
    Aborted(String),
    /// Transient fault; the job may run again no earlier than `retry_at`.
    #[error("retryable failure: {message}")]
    Retryable {
        message: String,
        retry_at: DateTime<Utc>,
    },
    /// Non-transient domain failure.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl JobError {
    /// The standard abort error, raised when the signal fires.
    pub fn aborted() -> Self {
        Self::Aborted("job aborted".to_string())
    }

    pub fn retryable(message: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_at,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    /// Stable kind tag carried by `job_error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Aborted(_) => "aborted",
            JobError::Retryable { .. } => "retryable",
            JobError::Permanent(_) => "permanent",
        }
    }

    /// The human-readable message, without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            JobError::Aborted(message) => message,
            JobError::Retryable { message, .. } => message,
            JobError::Permanent(message) => message,
        }
    }
}

/// Backend persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    Duplicate(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid status transition for job {id}: {from:?} is terminal")]
    InvalidTransition { id: JobId, from: JobStatus },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a backend-specific error (database, filesystem).
    pub fn backend(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }

    /// Wrap a backend failure that only exists as a message.
    pub fn backend_msg(message: impl Into<String>) -> Self {
        Self::Backend(message.into().into())
    }
}

/// Limiter rejection for callers that opt into failing instead of waiting.
///
/// The scheduling loop never sees this; it sleeps until the limiter's next
/// available time instead.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("rate limit exceeded; next start allowed at {retry_at}")]
pub struct RateLimitExceeded {
    pub retry_at: DateTime<Utc>,
}

/// Queue registry failure.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("queue already registered: {0}")]
    DuplicateQueue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_kinds_are_stable() {
        assert_eq!(JobError::aborted().kind(), "aborted");
        assert_eq!(JobError::retryable("io", Utc::now()).kind(), "retryable");
        assert_eq!(JobError::permanent("bad input").kind(), "permanent");
    }

    #[test]
    fn store_error_wraps_backend_errors() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = StoreError::backend(inner);
        assert!(err.to_string().contains("disk full"));
    }
}
