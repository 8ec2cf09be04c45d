use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use taskmill_core::{
    Dispatcher, DispatcherConfig, HandlerRegistry, MemoryStore, Task, TaskHandler, TaskStore,
    TaskmillError,
};

#[derive(Debug, Deserialize)]
struct GreetPayload {
    name: String,
}

/// Fails a few times before succeeding, to show the retry path.
struct GreetHandler {
    remaining_failures: AtomicU32,
}

impl GreetHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
        }
    }
}

#[async_trait]
impl TaskHandler for GreetHandler {
    async fn handle(&self, payload: serde_json::Value, task: &Task) -> Result<(), TaskmillError> {
        let p: GreetPayload = serde_json::from_value(payload)
            .map_err(|e| TaskmillError::handler(format!("json decode: {e}")))?;

        let left = self.remaining_failures.load(Ordering::Relaxed);
        if left > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::Relaxed);
            return Err(TaskmillError::handler(format!(
                "intentional failure (left={left})"
            )));
        }

        tracing::info!(id = %task.id, attempt = task.retry_count + 1, "Hello, {}!", p.name);
        Ok(())
    }
}

/// Never succeeds; ends up `failed` once retries run out.
struct DoomedHandler;

#[async_trait]
impl TaskHandler for DoomedHandler {
    async fn handle(&self, _payload: serde_json::Value, _task: &Task) -> Result<(), TaskmillError> {
        Err(TaskmillError::handler("this one never works"))
    }
}

#[tokio::main]
async fn main() -> Result<(), TaskmillError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // (A) Store and handlers.
    let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
    let mut registry = HandlerRegistry::new();
    registry.register("greet", Arc::new(GreetHandler::new(2)));
    registry.register("doomed", Arc::new(DoomedHandler));

    // (B) Dispatcher with a fast poll so the demo finishes quickly.
    let config = DispatcherConfig {
        concurrency: 3,
        polling_interval: Duration::from_millis(100),
        ..DispatcherConfig::default()
    };
    let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(registry), config)?;

    // (C) Enqueue work: the higher priority greet runs first.
    let greet = store
        .insert(
            "greet",
            100,
            serde_json::json!({ "name": "taskmill" }).to_string(),
            3,
        )
        .await?;
    let doomed = store.insert("doomed", 50, "{}".to_string(), 2).await?;
    tracing::info!(%greet, %doomed, "tasks enqueued");

    // (D) Run until everything reaches a terminal state.
    dispatcher.start().await;
    loop {
        let counts = store.aggregate_counts().await?;
        if counts.completed + counts.failed == counts.total {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    dispatcher.stop().await;

    let counts = store.aggregate_counts().await?;
    tracing::info!(?counts, "final store counts");
    if let Some(task) = store.get_by_id(doomed).await? {
        tracing::info!(
            id = %task.id,
            status = %task.status,
            error = task.error_message.as_deref().unwrap_or("-"),
            "doomed task outcome"
        );
    }

    store.close().await?;
    Ok(())
}
