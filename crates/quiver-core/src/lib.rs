//! Core contract between queues, stores, and job runners.
//!
//! A [`JobQueue`] pairs a [`JobStore`] with a [`RateLimiter`] and drives a
//! cooperative scheduling loop: claim the earliest eligible pending job,
//! hand it to the registered [`JobRunner`] with a cancellation signal,
//! classify the outcome, persist the transition, and publish a typed
//! [`QueueEvent`]. Stores are pluggable; the in-memory one ships here and
//! SQL backends live in their own crate.

pub mod abort;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod job;
pub mod limiter;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod store;

pub use abort::AbortRegistry;
pub use error::{JobError, RateLimitExceeded, RegistryError, StoreError};
pub use events::{EventBus, QueueEvent};
pub use fingerprint::fingerprint;
pub use job::{ExecutionOutcome, Job, JobId, JobStatus, NewJob};
pub use limiter::{ConcurrencyLimiter, RateLimitStore, RateLimiter, StoredRateLimiter};
pub use memory::MemoryJobStore;
pub use queue::{JobQueue, JobRunner, QueueConfig, runner_fn};
pub use registry::QueueRegistry;
pub use store::JobStore;
