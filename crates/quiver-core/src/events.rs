//! Typed lifecycle events and the per-queue broadcast bus.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::job::{JobId, JobStatus};

/// Lifecycle event emitted by a queue, synchronously with the state
/// transition it describes.
///
/// For a single job the causal order holds: `JobStart` precedes the
/// terminal event, and `JobAborting` precedes it as well. No ordering is
/// guaranteed between distinct jobs.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    QueueStart {
        queue: String,
    },
    QueueStop {
        queue: String,
    },
    JobAdded {
        queue: String,
        job_id: JobId,
    },
    JobStart {
        queue: String,
        job_id: JobId,
    },
    JobComplete {
        queue: String,
        job_id: JobId,
        status: JobStatus,
        output: Option<Value>,
    },
    JobError {
        queue: String,
        job_id: JobId,
        kind: &'static str,
        message: String,
    },
    JobAborting {
        queue: String,
        job_id: JobId,
    },
    JobRetry {
        queue: String,
        job_id: JobId,
        run_after: DateTime<Utc>,
    },
    JobSkipped {
        queue: String,
        job_id: JobId,
    },
}

impl QueueEvent {
    /// Stable topic name.
    pub fn kind(&self) -> &'static str {
        match self {
            QueueEvent::QueueStart { .. } => "queue_start",
            QueueEvent::QueueStop { .. } => "queue_stop",
            QueueEvent::JobAdded { .. } => "job_added",
            QueueEvent::JobStart { .. } => "job_start",
            QueueEvent::JobComplete { .. } => "job_complete",
            QueueEvent::JobError { .. } => "job_error",
            QueueEvent::JobAborting { .. } => "job_aborting",
            QueueEvent::JobRetry { .. } => "job_retry",
            QueueEvent::JobSkipped { .. } => "job_skipped",
        }
    }

    pub fn queue_name(&self) -> &str {
        match self {
            QueueEvent::QueueStart { queue }
            | QueueEvent::QueueStop { queue }
            | QueueEvent::JobAdded { queue, .. }
            | QueueEvent::JobStart { queue, .. }
            | QueueEvent::JobComplete { queue, .. }
            | QueueEvent::JobError { queue, .. }
            | QueueEvent::JobAborting { queue, .. }
            | QueueEvent::JobRetry { queue, .. }
            | QueueEvent::JobSkipped { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::QueueStart { .. } | QueueEvent::QueueStop { .. } => None,
            QueueEvent::JobAdded { job_id, .. }
            | QueueEvent::JobStart { job_id, .. }
            | QueueEvent::JobComplete { job_id, .. }
            | QueueEvent::JobError { job_id, .. }
            | QueueEvent::JobAborting { job_id, .. }
            | QueueEvent::JobRetry { job_id, .. }
            | QueueEvent::JobSkipped { job_id, .. } => Some(*job_id),
        }
    }
}

/// Multi-subscriber fan-out that never blocks the scheduling loop.
///
/// Slow subscribers lag and eventually drop messages rather than applying
/// backpressure; handlers that must not miss events should drain promptly.
#[derive(Debug)]
pub struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(
            queue = event.queue_name(),
            event = event.kind(),
            "publish event"
        );
        // Nobody listening is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
