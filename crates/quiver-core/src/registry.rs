//! Process-wide registry of named queues.
//!
//! Constructed explicitly at program start and torn down explicitly;
//! nothing here relies on implicit finalization.

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::RegistryError;
use crate::queue::JobQueue;

/// Maps logical queue names (for example `"local_hf"`,
/// `"local_media_pipe"`) to their queues and drives bulk start/stop.
#[derive(Default)]
pub struct QueueRegistry {
    // Registration order matters: shutdown runs in reverse.
    queues: Mutex<Vec<JobQueue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue under its own name.
    pub async fn register(&self, queue: JobQueue) -> Result<(), RegistryError> {
        let mut queues = self.queues.lock().await;
        if queues.iter().any(|existing| existing.name() == queue.name()) {
            return Err(RegistryError::DuplicateQueue(queue.name().to_string()));
        }
        info!(queue = queue.name(), "queue registered");
        queues.push(queue);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<JobQueue> {
        let queues = self.queues.lock().await;
        queues.iter().find(|queue| queue.name() == name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues.iter().map(|queue| queue.name().to_string()).collect()
    }

    /// Start every registered queue.
    pub async fn start_all(&self) {
        let queues = self.queues.lock().await.clone();
        join_all(queues.iter().map(|queue| queue.start())).await;
    }

    /// Stop every registered queue, newest registration first, returning
    /// only once each queue's `stop` has completed.
    pub async fn stop_all(&self) {
        let queues = self.queues.lock().await.clone();
        for queue in queues.iter().rev() {
            queue.stop().await;
        }
    }
}
