//! Rate limiting for the scheduling loop.
//!
//! A limiter answers one question: may the next job start now, and if not,
//! when is the next start permitted. Two variants ship. The
//! [`ConcurrencyLimiter`] keeps everything in process: a token bucket sized
//! by `max_concurrent` plus a sliding window capping starts per period. The
//! [`StoredRateLimiter`] keeps its window ledger behind a [`RateLimitStore`]
//! so the rate envelope survives a restart.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{RateLimitExceeded, StoreError};

/// Decides when the next job may start and records start/completion.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn can_proceed(&self) -> Result<bool, StoreError>;

    /// Earliest instant a start is permitted. Returns a time at or before
    /// `now` when a start is already permitted.
    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError>;

    async fn record_job_start(&self) -> Result<(), StoreError>;

    async fn record_job_completion(&self) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    /// Rejecting variant for callers that opt in; the scheduling loop never
    /// uses this, it waits instead.
    async fn check(&self) -> Result<(), RateLimitExceeded> {
        match self.can_proceed().await {
            Ok(true) => Ok(()),
            _ => {
                let retry_at = self
                    .next_available_time()
                    .await
                    .unwrap_or_else(|_| Utc::now());
                Err(RateLimitExceeded { retry_at })
            }
        }
    }
}

#[derive(Debug, Default)]
struct ConcurrencyState {
    in_flight: usize,
    window_starts: VecDeque<Instant>,
}

/// Token bucket of `max_concurrent` slots plus a sliding window of at most
/// `max_per_window` starts per `window`.
///
/// The window is tracked on the Tokio clock, so tests can pause and advance
/// it deterministically.
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    max_per_window: usize,
    window: std::time::Duration,
    state: Mutex<ConcurrencyState>,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize, max_per_window: usize, window: std::time::Duration) -> Self {
        Self {
            max_concurrent,
            max_per_window,
            window,
            state: Mutex::new(ConcurrencyState::default()),
        }
    }

    /// A limiter that only caps concurrency, with no windowed rate.
    pub fn concurrent_only(max_concurrent: usize) -> Self {
        Self::new(max_concurrent, usize::MAX, std::time::Duration::from_secs(1))
    }

    fn prune(&self, state: &mut ConcurrencyState, now: Instant) {
        while state
            .window_starts
            .front()
            .is_some_and(|start| now.saturating_duration_since(*start) >= self.window)
        {
            state.window_starts.pop_front();
        }
    }
}

#[async_trait]
impl RateLimiter for ConcurrencyLimiter {
    async fn can_proceed(&self) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.prune(&mut state, now);
        Ok(state.in_flight < self.max_concurrent
            && state.window_starts.len() < self.max_per_window)
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.prune(&mut state, now);
        if state.window_starts.len() >= self.max_per_window {
            // The oldest start ages out of the window first.
            if let Some(oldest) = state.window_starts.front() {
                let remaining = self.window.saturating_sub(now.duration_since(*oldest));
                let delta = Duration::from_std(remaining).unwrap_or(Duration::MAX);
                return Ok(Utc::now()
                    .checked_add_signed(delta)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC));
            }
        }
        // Token exhaustion clears when some job completes; there is no
        // schedule for that, so the caller polls.
        Ok(Utc::now())
    }

    async fn record_job_start(&self) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        self.prune(&mut state, now);
        state.in_flight += 1;
        state.window_starts.push_back(now);
        Ok(())
    }

    async fn record_job_completion(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.in_flight = 0;
        state.window_starts.clear();
        Ok(())
    }
}

fn window_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Persisted start-time ledger, implemented by the storage backends so the
/// window survives a restart.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn record_start(&self, queue: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Start instants at or after `since`, oldest first.
    async fn starts_since(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>, StoreError>;

    async fn prune_before(&self, queue: &str, cutoff: DateTime<Utc>) -> Result<(), StoreError>;

    async fn clear_starts(&self, queue: &str) -> Result<(), StoreError>;
}

/// Sliding-window limiter whose ledger lives in the backing store.
pub struct StoredRateLimiter {
    queue: String,
    store: Arc<dyn RateLimitStore>,
    max_per_window: usize,
    window: Duration,
}

impl StoredRateLimiter {
    pub fn new(
        queue: impl Into<String>,
        store: Arc<dyn RateLimitStore>,
        max_per_window: usize,
        window: std::time::Duration,
    ) -> Self {
        Self {
            queue: queue.into(),
            store,
            max_per_window,
            window: Duration::from_std(window).unwrap_or(Duration::MAX),
        }
    }

    async fn window_starts(&self) -> Result<Vec<DateTime<Utc>>, StoreError> {
        let since = window_cutoff(Utc::now(), self.window);
        self.store.starts_since(&self.queue, since).await
    }
}

#[async_trait]
impl RateLimiter for StoredRateLimiter {
    async fn can_proceed(&self) -> Result<bool, StoreError> {
        Ok(self.window_starts().await?.len() < self.max_per_window)
    }

    async fn next_available_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let starts = self.window_starts().await?;
        if starts.len() < self.max_per_window {
            return Ok(Utc::now());
        }
        match starts.first() {
            Some(oldest) => Ok(*oldest + self.window),
            None => Ok(Utc::now()),
        }
    }

    async fn record_job_start(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store.record_start(&self.queue, now).await?;
        self.store
            .prune_before(&self.queue, window_cutoff(now, self.window))
            .await
    }

    async fn record_job_completion(&self) -> Result<(), StoreError> {
        // Only the window is persisted; completion frees nothing here.
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.store.clear_starts(&self.queue).await
    }
}
