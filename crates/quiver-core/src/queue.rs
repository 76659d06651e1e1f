//! Queue orchestration: the scheduling loop, retries, and abort fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::abort::AbortRegistry;
use crate::error::{JobError, StoreError};
use crate::events::{EventBus, QueueEvent};
use crate::fingerprint::fingerprint;
use crate::job::{ExecutionOutcome, Job, JobId, JobStatus, NewJob};
use crate::limiter::RateLimiter;
use crate::store::JobStore;

/// Executes jobs of one task type.
///
/// Implementations must propagate `signal` into any nested cancellable work
/// and return [`JobError::Aborted`] promptly when it fires. Cancellation is
/// cooperative: a runner that ignores the signal runs to completion and
/// cannot be forcibly killed.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, input: Value, signal: CancellationToken) -> Result<Value, JobError>;
}

struct FnRunner<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobRunner for FnRunner<F>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn run(&self, input: Value, signal: CancellationToken) -> Result<Value, JobError> {
        (self.f)(input, signal).await
    }
}

/// Wrap an async closure as a [`JobRunner`].
pub fn runner_fn<F, Fut>(f: F) -> Arc<dyn JobRunner>
where
    F: Fn(Value, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    Arc::new(FnRunner { f })
}

/// Tunables for a queue's scheduling loop.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Polling granularity when idle or rate limited.
    pub wait_duration: std::time::Duration,
    /// Broadcast buffer for lifecycle events.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            wait_duration: std::time::Duration::from_millis(100),
            event_capacity: 256,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

struct QueueInner {
    name: String,
    store: Arc<dyn JobStore>,
    limiter: Arc<dyn RateLimiter>,
    runners: RwLock<HashMap<String, Arc<dyn JobRunner>>>,
    aborts: AbortRegistry,
    events: EventBus,
    config: QueueConfig,
    lifecycle: Mutex<Lifecycle>,
}

/// A named scheduling domain pairing a store, a limiter, and a loop.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self::with_config(name, store, limiter, QueueConfig::default())
    }

    pub fn with_config(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        limiter: Arc<dyn RateLimiter>,
        config: QueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                store,
                limiter,
                runners: RwLock::new(HashMap::new()),
                aborts: AbortRegistry::new(),
                events: EventBus::new(config.event_capacity),
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Register the executor for a task type. Jobs claimed with no
    /// registered runner are marked `Skipped`.
    pub async fn register_runner(&self, task_type: impl Into<String>, runner: Arc<dyn JobRunner>) {
        self.inner
            .runners
            .write()
            .await
            .insert(task_type.into(), runner);
    }

    /// Enqueue a job: assigns identifiers, fingerprints the input, writes
    /// through the store. Never blocks on queue depth; backpressure shows up
    /// as a growing pending count in [`JobQueue::size`].
    pub async fn add(&self, new_job: NewJob) -> Result<JobId, StoreError> {
        let job = Job::assemble(self.inner.name.clone(), new_job);
        let id = job.id;
        let task_type = job.task_type.clone();
        self.inner.store.add(job).await?;
        self.inner.events.publish(QueueEvent::JobAdded {
            queue: self.inner.name.clone(),
            job_id: id,
        });
        debug!(queue = %self.inner.name, job_id = %id, task_type = %task_type, "job added");
        Ok(id)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        self.inner.store.get(id).await
    }

    /// Memoized output of any completed job with the same task type and a
    /// semantically equal input.
    pub async fn output_for_input(
        &self,
        task_type: &str,
        input: &Value,
    ) -> Result<Option<Value>, StoreError> {
        self.inner
            .store
            .output_for_fingerprint(task_type, &fingerprint(input))
            .await
    }

    pub async fn size(&self) -> Result<usize, StoreError> {
        self.inner.store.size().await
    }

    pub async fn delete_all(&self) -> Result<(), StoreError> {
        self.inner.store.delete_all().await
    }

    /// Launch the scheduling loop. Idempotent; a second call while running
    /// is a no-op.
    pub async fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if lifecycle.task.is_some() {
            debug!(queue = %self.inner.name, "start called while already running");
            return;
        }
        let (tx, rx) = watch::channel(false);
        lifecycle.shutdown = Some(tx);
        lifecycle.task = Some(tokio::spawn(self.clone().run_loop(rx)));
        drop(lifecycle);

        self.inner.events.publish(QueueEvent::QueueStart {
            queue: self.inner.name.clone(),
        });
        info!(queue = %self.inner.name, "queue started");
    }

    /// Signal the loop to exit and wait for in-flight jobs to observe
    /// cancellation or complete. Idempotent.
    pub async fn stop(&self) {
        let (shutdown, task) = {
            let mut lifecycle = self.inner.lifecycle.lock().await;
            (lifecycle.shutdown.take(), lifecycle.task.take())
        };
        let Some(shutdown) = shutdown else {
            return;
        };
        let _ = shutdown.send(true);
        if let Some(task) = task {
            if let Err(join_error) = task.await {
                error!(queue = %self.inner.name, error = %join_error, "scheduling loop panicked");
            }
        }

        self.inner.events.publish(QueueEvent::QueueStop {
            queue: self.inner.name.clone(),
        });
        info!(queue = %self.inner.name, "queue stopped");
    }

    /// Request an abort: persist `Aborting` (or fail a pending job outright)
    /// and fire the in-process cancellation handle if the job runs here.
    pub async fn abort(&self, id: JobId) -> Result<Job, StoreError> {
        let job = self.inner.store.abort(id).await?;
        self.inner.events.publish(QueueEvent::JobAborting {
            queue: self.inner.name.clone(),
            job_id: id,
        });

        let cancelled = self.inner.aborts.cancel(id);
        if job.status == JobStatus::Failed {
            // Pending job aborted before any executor held it; no task will
            // report a terminal event, so emit it here.
            self.inner.events.publish(QueueEvent::JobError {
                queue: self.inner.name.clone(),
                job_id: id,
                kind: "aborted",
                message: job
                    .error
                    .clone()
                    .unwrap_or_else(|| JobError::aborted().message().to_string()),
            });
        } else if !cancelled {
            debug!(queue = %self.inner.name, job_id = %id, "abort requested for job not running in this process");
        }
        Ok(job)
    }

    /// Abort every `Pending` or `Processing` job sharing `run_id`.
    pub async fn abort_run(&self, run_id: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.inner.store.jobs_by_run_id(run_id).await?;
        let mut aborted = Vec::new();
        for job in jobs {
            if !matches!(job.status, JobStatus::Pending | JobStatus::Processing) {
                continue;
            }
            match self.abort(job.id).await {
                Ok(job) => aborted.push(job),
                Err(abort_error) => {
                    warn!(queue = %self.inner.name, job_id = %job.id, error = %abort_error, "failed to abort job in run");
                }
            }
        }
        Ok(aborted)
    }

    /// Resolve when the job reaches a terminal state: the output on
    /// `Completed`, the classified error otherwise.
    pub async fn wait_for(&self, id: JobId) -> Result<Value, JobError> {
        let mut events = self.inner.events.subscribe();

        if let Some(result) = self.terminal_result(id).await {
            return result;
        }

        loop {
            match events.recv().await {
                Ok(event) if event.job_id() == Some(id) => match event {
                    QueueEvent::JobComplete { output, .. } => {
                        return Ok(output.unwrap_or(Value::Null));
                    }
                    QueueEvent::JobError { kind, message, .. } => {
                        return Err(match kind {
                            "aborted" => JobError::Aborted(message),
                            _ => JobError::Permanent(message),
                        });
                    }
                    QueueEvent::JobSkipped { .. } => {
                        return Err(JobError::permanent("job skipped: no runner registered"));
                    }
                    _ => {}
                },
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    // Dropped behind the bus; the store still has the truth.
                    if let Some(result) = self.terminal_result(id).await {
                        return result;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return match self.terminal_result(id).await {
                        Some(result) => result,
                        None => Err(JobError::permanent("queue dropped before the job finished")),
                    };
                }
            }
        }
    }

    async fn terminal_result(&self, id: JobId) -> Option<Result<Value, JobError>> {
        match self.inner.store.get(id).await {
            Ok(Some(job)) if job.status.is_terminal() => {
                let message = job.error.unwrap_or_else(|| "job failed".to_string());
                Some(match job.status {
                    JobStatus::Completed => Ok(job.output.unwrap_or(Value::Null)),
                    JobStatus::Skipped => Err(JobError::Permanent(message)),
                    _ => {
                        if message == JobError::aborted().message() {
                            Err(JobError::Aborted(message))
                        } else {
                            Err(JobError::Permanent(message))
                        }
                    }
                })
            }
            Ok(_) => None,
            Err(store_error) => Some(Err(JobError::permanent(format!(
                "store error while waiting: {store_error}"
            )))),
        }
    }

    /// Cooperative scheduling loop, one per queue.
    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let wait = self.inner.config.wait_duration;
        let mut tasks: JoinSet<()> = JoinSet::new();
        debug!(queue = %self.inner.name, "scheduling loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Reap finished executions; their bookkeeping already ran.
            while tasks.try_join_next().is_some() {}

            match self.inner.limiter.can_proceed().await {
                Ok(true) => {}
                Ok(false) => {
                    let pause = match self.inner.limiter.next_available_time().await {
                        Ok(next) => {
                            let until = (next - Utc::now())
                                .to_std()
                                .unwrap_or(std::time::Duration::ZERO);
                            if until.is_zero() { wait } else { until.min(wait) }
                        }
                        Err(limiter_error) => {
                            warn!(queue = %self.inner.name, error = %limiter_error, "failed to read next available time");
                            wait
                        }
                    };
                    self.idle(&mut shutdown, pause).await;
                    continue;
                }
                Err(limiter_error) => {
                    error!(queue = %self.inner.name, error = %limiter_error, "rate limiter check failed");
                    self.idle(&mut shutdown, wait).await;
                    continue;
                }
            }

            match self.inner.store.next().await {
                Ok(Some(job)) => {
                    let signal = self.inner.aborts.register(job.id);
                    if let Err(limiter_error) = self.inner.limiter.record_job_start().await {
                        warn!(queue = %self.inner.name, error = %limiter_error, "failed to record job start");
                    }
                    self.inner.events.publish(QueueEvent::JobStart {
                        queue: self.inner.name.clone(),
                        job_id: job.id,
                    });
                    debug!(queue = %self.inner.name, job_id = %job.id, task_type = %job.task_type, "claimed job");

                    let queue = self.clone();
                    tasks.spawn(async move { queue.execute(job, signal).await });
                }
                Ok(None) => self.idle(&mut shutdown, wait).await,
                Err(store_error) => {
                    error!(queue = %self.inner.name, error = %store_error, "failed to claim next job");
                    self.idle(&mut shutdown, wait).await;
                }
            }
        }

        if !tasks.is_empty() {
            debug!(queue = %self.inner.name, in_flight = tasks.len(), "draining in-flight jobs");
        }
        // In-flight jobs observe cancellation on shutdown; runners that
        // honor the signal settle, runners that do not run to completion.
        self.inner.aborts.cancel_all();
        while tasks.join_next().await.is_some() {}
        debug!(queue = %self.inner.name, "scheduling loop stopped");
    }

    async fn idle(&self, shutdown: &mut watch::Receiver<bool>, duration: std::time::Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn execute(&self, job: Job, signal: CancellationToken) {
        // An abort may have landed between the claim and the handle
        // registration; fire the signal now so the runner observes it.
        if let Ok(Some(current)) = self.inner.store.get(job.id).await {
            if current.status == JobStatus::Aborting {
                signal.cancel();
            }
        }

        let runner = self.inner.runners.read().await.get(&job.task_type).cloned();
        let outcome = match runner {
            None => {
                warn!(queue = %self.inner.name, job_id = %job.id, task_type = %job.task_type, "no runner registered; skipping job");
                ExecutionOutcome::Skipped(format!(
                    "no runner registered for task type '{}'",
                    job.task_type
                ))
            }
            Some(runner) => match self.run_with_deadline(&job, runner, signal).await {
                Ok(output) => ExecutionOutcome::Success(output),
                Err(job_error) => ExecutionOutcome::Failure(job_error),
            },
        };
        self.finish(job, outcome).await;
    }

    async fn run_with_deadline(
        &self,
        job: &Job,
        runner: Arc<dyn JobRunner>,
        signal: CancellationToken,
    ) -> Result<Value, JobError> {
        let run = runner.run(job.input.clone(), signal.clone());
        let Some(deadline) = job.deadline_at else {
            return run.await;
        };

        let until = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = tokio::time::sleep(until) => {
                debug!(queue = %self.inner.name, job_id = %job.id, "deadline reached, cancelling job");
                signal.cancel();
                // Same path as an abort: the runner observes the signal.
                run.await
            }
        }
    }

    /// Persist the outcome, emit the matching event, release bookkeeping.
    async fn finish(&self, job: Job, outcome: ExecutionOutcome) {
        let id = job.id;
        let updated = self.inner.store.complete(id, &outcome).await;
        self.inner.aborts.remove(id);
        if let Err(limiter_error) = self.inner.limiter.record_job_completion().await {
            warn!(queue = %self.inner.name, error = %limiter_error, "failed to record job completion");
        }

        let updated = match updated {
            Ok(updated) => updated,
            Err(store_error) => {
                // Never a silent transition: the failure is loud and the job
                // keeps whatever status the store last held.
                error!(queue = %self.inner.name, job_id = %id, error = %store_error, "failed to persist job outcome");
                return;
            }
        };

        let queue = self.inner.name.clone();
        match updated.status {
            JobStatus::Completed => {
                debug!(queue = %queue, job_id = %id, "job completed");
                self.inner.events.publish(QueueEvent::JobComplete {
                    queue,
                    job_id: id,
                    status: updated.status,
                    output: updated.output.clone(),
                });
            }
            JobStatus::Pending => {
                debug!(queue = %queue, job_id = %id, retries = updated.retries, run_after = %updated.run_after, "job re-queued for retry");
                self.inner.events.publish(QueueEvent::JobRetry {
                    queue,
                    job_id: id,
                    run_after: updated.run_after,
                });
            }
            JobStatus::Skipped => {
                self.inner
                    .events
                    .publish(QueueEvent::JobSkipped { queue, job_id: id });
            }
            JobStatus::Failed => {
                let (kind, message) = match &outcome {
                    ExecutionOutcome::Failure(job_error) => {
                        (job_error.kind(), job_error.message().to_string())
                    }
                    _ => ("permanent", updated.error.clone().unwrap_or_default()),
                };
                warn!(queue = %queue, job_id = %id, kind = kind, error = %message, "job failed");
                self.inner.events.publish(QueueEvent::JobError {
                    queue,
                    job_id: id,
                    kind,
                    message,
                });
            }
            other => {
                warn!(queue = %queue, job_id = %id, status = ?other, "unexpected status after applying outcome");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::ConcurrencyLimiter;
    use crate::memory::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_queue(limiter: ConcurrencyLimiter) -> JobQueue {
        JobQueue::with_config(
            "test_queue",
            Arc::new(MemoryJobStore::new()),
            Arc::new(limiter),
            QueueConfig {
                wait_duration: std::time::Duration::from_millis(5),
                event_capacity: 256,
            },
        )
    }

    /// Runner used by the drain tests: replaces "input" with "output" in the
    /// data field.
    fn echo_runner() -> Arc<dyn JobRunner> {
        runner_fn(|input: Value, _signal| async move {
            let data = input
                .get("data")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .replace("input", "output");
            Ok(json!({ "result": data }))
        })
    }

    /// Runner that parks until its signal fires, then reports the abort.
    fn parked_runner() -> Arc<dyn JobRunner> {
        runner_fn(|_input, signal: CancellationToken| async move {
            signal.cancelled().await;
            Err(JobError::aborted())
        })
    }

    async fn wait_until<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..400 {
            if condition().await {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn add_assigns_ids_and_emits_event() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(4));
        let mut events = queue.subscribe();

        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.fingerprint, fingerprint(&json!({"data": "input1"})));
        assert!(job.run_id.is_some());
        assert_eq!(queue.size().await.unwrap(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.kind(), "job_added");
        assert_eq!(event.job_id(), Some(id));
    }

    #[tokio::test]
    async fn duplicate_caller_supplied_id_is_rejected() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        let id = JobId::new();
        queue
            .add(NewJob::new("task1", json!(1)).id(id))
            .await
            .unwrap();
        assert!(matches!(
            queue.add(NewJob::new("task1", json!(2)).id(id)).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn drains_jobs_in_order() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(4));
        queue.register_runner("task1", echo_runner()).await;
        queue.register_runner("task2", echo_runner()).await;

        let mut ids = Vec::new();
        for (task_type, data) in [
            ("task1", "input1"),
            ("task2", "input2"),
            ("task1", "input1b"),
            ("task2", "input2"),
        ] {
            ids.push(
                queue
                    .add(NewJob::new(task_type, json!({ "data": data })))
                    .await
                    .unwrap(),
            );
        }

        queue.start().await;
        let last = *ids.last().unwrap();
        let output = queue.wait_for(last).await.unwrap();
        assert_eq!(output, json!({"result": "output2"}));
        for id in &ids {
            queue.wait_for(*id).await.unwrap();
        }
        queue.stop().await;

        for id in ids {
            let job = queue.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test]
    async fn memoizes_output_by_input() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(4));
        queue.register_runner("task1", echo_runner()).await;

        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        queue.start().await;
        queue.wait_for(id).await.unwrap();
        queue.stop().await;

        let memoized = queue
            .output_for_input("task1", &json!({"data": "input1"}))
            .await
            .unwrap();
        assert_eq!(memoized, Some(json!({"result": "output1"})));
        assert_eq!(
            queue
                .output_for_input("task1", &json!({"data": "never-ran"}))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn window_limit_leaves_jobs_pending() {
        // 4 starts per second; six jobs; a short drain window.
        let queue = test_queue(ConcurrencyLimiter::new(
            16,
            4,
            std::time::Duration::from_secs(1),
        ));
        queue.register_runner("task1", echo_runner()).await;

        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(
                queue
                    .add(NewJob::new("task1", json!({ "data": format!("input{i}") })))
                    .await
                    .unwrap(),
            );
        }

        queue.start().await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        queue.stop().await;

        let mut pending = 0;
        for id in ids {
            let job = queue.get(id).await.unwrap().unwrap();
            if job.status == JobStatus::Pending {
                pending += 1;
            }
        }
        assert!(pending >= 1, "window limit should starve at least one job");
    }

    #[tokio::test]
    async fn abort_reaches_in_flight_job() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        queue.register_runner("task1", parked_runner()).await;
        let mut events = queue.subscribe();

        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        queue.start().await;

        let store = queue.clone();
        wait_until(|| {
            let store = store.clone();
            async move {
                store.get(id).await.unwrap().unwrap().status == JobStatus::Processing
            }
        })
        .await;

        queue.abort(id).await.unwrap();
        let wait_error = queue.wait_for(id).await.unwrap_err();
        assert_eq!(wait_error.kind(), "aborted");

        let mut saw_aborting = false;
        while let Ok(event) = events.try_recv() {
            if event.kind() == "job_aborting" && event.job_id() == Some(id) {
                saw_aborting = true;
            }
        }
        assert!(saw_aborting);

        queue.stop().await;
        assert!(queue.inner.aborts.is_empty());
    }

    #[tokio::test]
    async fn abort_run_only_touches_that_run() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(4));
        queue.register_runner("task1", parked_runner()).await;

        let mut r1 = Vec::new();
        let mut r2 = Vec::new();
        for (run_id, bucket) in [("r1", &mut r1), ("r2", &mut r2)] {
            for i in 0..2 {
                bucket.push(
                    queue
                        .add(NewJob::new("task1", json!({ "n": i })).run_id(run_id))
                        .await
                        .unwrap(),
                );
            }
        }

        queue.start().await;
        let probe = queue.clone();
        wait_until(|| {
            let probe = probe.clone();
            async move { probe.inner.store.processing().await.unwrap().len() == 4 }
        })
        .await;

        queue.abort_run("r1").await.unwrap();

        let probe = queue.clone();
        let r1_probe = r1.clone();
        wait_until(|| {
            let probe = probe.clone();
            let r1 = r1_probe.clone();
            async move {
                let mut settled = true;
                for id in r1 {
                    settled &=
                        probe.get(id).await.unwrap().unwrap().status == JobStatus::Failed;
                }
                settled
            }
        })
        .await;

        for id in r2 {
            let job = queue.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Processing);
        }

        queue.stop().await;
    }

    #[tokio::test]
    async fn retryable_failures_requeue_then_succeed() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        queue
            .register_runner(
                "task1",
                runner_fn(move |_input, _signal| {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(JobError::retryable("transient", Utc::now()))
                        } else {
                            Ok(json!("done"))
                        }
                    }
                }),
            )
            .await;
        let mut events = queue.subscribe();

        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        queue.start().await;

        assert_eq!(queue.wait_for(id).await.unwrap(), json!("done"));
        queue.stop().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retries, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let mut saw_retry = false;
        while let Ok(event) = events.try_recv() {
            saw_retry |= event.kind() == "job_retry";
        }
        assert!(saw_retry);
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_job() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        queue
            .register_runner(
                "task1",
                runner_fn(|_input, _signal| async {
                    Err(JobError::retryable("always down", Utc::now()))
                }),
            )
            .await;

        let id = queue
            .add(NewJob::new("task1", json!(1)).max_retries(1))
            .await
            .unwrap();
        queue.start().await;

        let wait_error = queue.wait_for(id).await.unwrap_err();
        assert_eq!(wait_error.message(), "always down");
        queue.stop().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retries, 1);
    }

    #[tokio::test]
    async fn unregistered_task_type_is_skipped() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        let mut events = queue.subscribe();

        let id = queue.add(NewJob::new("unknown", json!(1))).await.unwrap();
        queue.start().await;

        let probe = queue.clone();
        wait_until(|| {
            let probe = probe.clone();
            async move { probe.get(id).await.unwrap().unwrap().status == JobStatus::Skipped }
        })
        .await;
        queue.stop().await;

        let mut saw_skip = false;
        while let Ok(event) = events.try_recv() {
            saw_skip |= event.kind() == "job_skipped" && event.job_id() == Some(id);
        }
        assert!(saw_skip);
    }

    #[tokio::test]
    async fn deadline_cancels_like_abort() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        queue.register_runner("task1", parked_runner()).await;

        let id = queue
            .add(
                NewJob::new("task1", json!(1))
                    .deadline_at(Utc::now() + chrono::Duration::milliseconds(30)),
            )
            .await
            .unwrap();
        queue.start().await;

        let wait_error = queue.wait_for(id).await.unwrap_err();
        assert_eq!(wait_error.kind(), "aborted");
        queue.stop().await;

        let job = queue.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        queue.start().await;
        queue.start().await;
        queue.stop().await;
        queue.stop().await;

        // A fresh start after stop works again.
        queue.register_runner("task1", echo_runner()).await;
        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        queue.start().await;
        queue.wait_for(id).await.unwrap();
        queue.stop().await;
    }

    #[tokio::test]
    async fn wait_for_already_completed_job_resolves_immediately() {
        let queue = test_queue(ConcurrencyLimiter::concurrent_only(2));
        queue.register_runner("task1", echo_runner()).await;
        let id = queue
            .add(NewJob::new("task1", json!({"data": "input1"})))
            .await
            .unwrap();
        queue.start().await;
        queue.wait_for(id).await.unwrap();
        queue.stop().await;

        // Queue is stopped; the answer comes straight from the store.
        let output = queue.wait_for(id).await.unwrap();
        assert_eq!(output, json!({"result": "output1"}));
    }
}
