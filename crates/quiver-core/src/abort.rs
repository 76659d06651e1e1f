//! Process-local cancellation handles for in-flight jobs.
//!
//! Strictly in-memory: aborting a job owned by another process requires
//! re-issuing the abort against that process. A job in `Processing` has
//! exactly one live handle here.

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::job::JobId;

/// Map from job id to the cancellation handle its executor watches.
#[derive(Debug, Default)]
pub struct AbortRegistry {
    handles: DashMap<JobId, CancellationToken>,
}

impl AbortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a fresh handle for `id` and return the token handed to the
    /// executor. Any stale handle for the same id is replaced.
    pub fn register(&self, id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles.insert(id, token.clone());
        token
    }

    /// Fire the handle for `id`. Returns false when no handle is installed,
    /// which callers treat as "not running here".
    pub fn cancel(&self, id: JobId) -> bool {
        match self.handles.get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the handle without firing it.
    pub fn remove(&self, id: JobId) {
        self.handles.remove(&id);
    }

    /// Fire every installed handle; used on queue shutdown so in-flight
    /// jobs observe cancellation.
    pub fn cancel_all(&self) {
        for entry in self.handles.iter() {
            entry.value().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
