use std::sync::Arc;

use quiver::{
    ConcurrencyLimiter, JobError, JobQueue, MemoryJobStore, NewJob, QueueRegistry, runner_fn,
};
use serde_json::{Value, json};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let queue = JobQueue::new(
        "local_hf",
        Arc::new(MemoryJobStore::new()),
        Arc::new(ConcurrencyLimiter::new(
            4,
            16,
            std::time::Duration::from_secs(1),
        )),
    );
    queue.register_runner("uppercase", uppercase_runner()).await;

    let registry = QueueRegistry::new();
    registry
        .register(queue.clone())
        .await
        .expect("queue name is unique");
    registry.start_all().await;

    let mut ids = Vec::new();
    for n in 0..8 {
        let id = queue
            .add(NewJob::new(
                "uppercase",
                json!({ "text": format!("job number {n}") }),
            ))
            .await
            .expect("memory store accepts inserts");
        tracing::info!(job_id = %id, "enqueued job");
        ids.push(id);
    }

    for id in ids {
        match queue.wait_for(id).await {
            Ok(output) => tracing::info!(job_id = %id, output = %output, "job finished"),
            Err(error) => tracing::error!(job_id = %id, error = %error, "job failed"),
        }
    }

    // Memoization: the same input again is answered from storage.
    let memoized = queue
        .output_for_input("uppercase", &json!({ "text": "job number 0" }))
        .await
        .expect("memory store answers lookups");
    tracing::info!(output = ?memoized, "memoized result");

    registry.stop_all().await;
}

fn uppercase_runner() -> Arc<dyn quiver::JobRunner> {
    runner_fn(|input: Value, _signal| async move {
        let text = input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::permanent("input must carry a text field"))?;
        Ok(json!({ "result": text.to_uppercase() }))
    })
}
