//! Durable, rate-limited, cancellable job queues.
//!
//! A [`JobQueue`] pairs a pluggable [`JobStore`] with a [`RateLimiter`] and
//! runs one cooperative scheduling loop: claim the earliest eligible pending
//! job, execute it through the registered [`JobRunner`] with a cancellation
//! signal, classify the outcome (complete, retry, fail, abort), persist the
//! transition, and publish a typed [`QueueEvent`]. Results are memoized by
//! an input fingerprint, so re-submitting a semantically equal input can be
//! answered from storage.
//!
//! Backends: [`MemoryJobStore`] (in-process), [`FileJobStore`] (directory
//! of JSON documents), and, behind the `sqlite`/`postgres` features, the
//! SQL stores from `quiver-sqlx`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quiver::{
//!     ConcurrencyLimiter, JobError, JobQueue, MemoryJobStore, NewJob, runner_fn,
//! };
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let queue = JobQueue::new(
//!         "local_hf",
//!         Arc::new(MemoryJobStore::new()),
//!         Arc::new(ConcurrencyLimiter::new(4, 16, std::time::Duration::from_secs(1))),
//!     );
//!     queue
//!         .register_runner(
//!             "embed",
//!             runner_fn(|input, _signal| async move {
//!                 Ok::<_, JobError>(json!({ "echo": input }))
//!             }),
//!         )
//!         .await;
//!
//!     queue.start().await;
//!     let id = queue.add(NewJob::new("embed", json!({"text": "hello"}))).await?;
//!     let output = queue.wait_for(id).await?;
//!     println!("{output}");
//!     queue.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! Cancellation is cooperative: runners receive a cancellation token and
//! are expected to observe it promptly. A runner that ignores the signal
//! runs to completion and cannot be forcibly killed.

pub use quiver_core::{
    AbortRegistry, ConcurrencyLimiter, EventBus, ExecutionOutcome, Job, JobError, JobId, JobQueue,
    JobRunner, JobStatus, JobStore, MemoryJobStore, NewJob, QueueConfig, QueueEvent, QueueRegistry,
    RateLimitExceeded, RateLimitStore, RateLimiter, RegistryError, StoreError, StoredRateLimiter,
    fingerprint, runner_fn,
};

pub mod file_store;
pub use file_store::FileJobStore;

#[cfg(feature = "postgres")]
pub use quiver_sqlx::PgJobStore;
#[cfg(feature = "sqlite")]
pub use quiver_sqlx::SqliteJobStore;
