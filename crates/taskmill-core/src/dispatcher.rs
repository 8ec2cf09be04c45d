//! Dispatcher: bridges durable pending work to bounded concurrent execution.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::{Task, TaskId};
use crate::error::TaskmillError;
use crate::gate::AdmissionGate;
use crate::ledger::Ledger;
use crate::ports::TaskStore;
use crate::registry::HandlerRegistry;
use crate::stats::DispatcherStats;

/// Dispatcher tuning knobs.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum parallel executions.
    pub concurrency: usize,

    /// Delay between poll cycles.
    pub polling_interval: Duration,

    /// Rate-limit window length.
    pub rate_interval: Duration,

    /// Maximum admissions per rate window.
    pub interval_cap: usize,

    /// Maximum tasks fetched per poll cycle.
    pub batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            polling_interval: Duration::from_secs(5),
            rate_interval: Duration::from_secs(1),
            interval_cap: 10,
            batch_size: 10,
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<(), TaskmillError> {
        if self.concurrency == 0 {
            return Err(TaskmillError::Config("concurrency must be at least 1".into()));
        }
        if self.interval_cap == 0 {
            return Err(TaskmillError::Config("interval_cap must be at least 1".into()));
        }
        if self.polling_interval.is_zero() {
            return Err(TaskmillError::Config("polling_interval must be non-zero".into()));
        }
        if self.rate_interval.is_zero() {
            return Err(TaskmillError::Config("rate_interval must be non-zero".into()));
        }
        if self.batch_size == 0 {
            return Err(TaskmillError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

/// Handle for the running poll loop.
struct PollLoop {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Dispatcher core shared with the poll loop and per-task executions.
struct Inner {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    ledger: Ledger,
    gate: AdmissionGate,
    config: DispatcherConfig,
    running: AtomicBool,

    /// Ids submitted but not yet finished. A task stays `pending` in the
    /// store until its execution claims it, so later poll cycles would
    /// fetch it again; this set keeps each task down to one in-flight
    /// submission and closes the double-claim window.
    submitted: Mutex<HashSet<TaskId>>,
}

impl Inner {
    /// One poll cycle: fetch eligible pending tasks and submit them for
    /// admission. Query errors are logged, never fatal to the loop.
    async fn poll_once(self: Arc<Self>) {
        let batch = match self.store.query_pending(self.config.batch_size).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "pending query failed, retrying next cycle");
                return;
            }
        };

        for task in batch {
            {
                let mut submitted = self.submitted.lock().await;
                if !submitted.insert(task.id) {
                    continue;
                }
            }

            // Submission does not block the cycle: the gate's waiting
            // happens inside the spawned execution.
            self.gate.enqueue();
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                let id = task.id;
                let permit = inner.gate.admit().await;
                inner.execute(task).await;
                drop(permit);
                inner.submitted.lock().await.remove(&id);
            });
        }
    }

    /// One task execution: claim, run the handler, report the outcome to
    /// the ledger. Nothing here ever propagates out of the spawned task.
    async fn execute(&self, task: Task) {
        if let Err(err) = self.ledger.claim(task.id).await {
            match err {
                TaskmillError::InvalidTransition { .. } => {
                    // Two executions raced for one task. A logic error in
                    // a single-dispatcher deployment, so make it loud.
                    tracing::error!(id = %task.id, error = %err, "claim raced, refusing to run");
                }
                _ => {
                    tracing::warn!(id = %task.id, error = %err, "claim failed, task left for a future poll");
                }
            }
            return;
        }

        let outcome = match self.registry.get(&task.name) {
            Some(handler) => handler.handle(task.payload_value(), &task).await,
            None => Err(TaskmillError::handler(format!(
                "no handler registered for task type: {}",
                task.name
            ))),
        };

        match outcome {
            Ok(()) => {
                if let Err(err) = self.ledger.record_success(task.id).await {
                    tracing::warn!(id = %task.id, error = %err, "success not recorded, task left for a future poll");
                }
            }
            Err(err) => {
                let message = err.to_string();
                tracing::debug!(id = %task.id, error = %message, "task execution failed");
                match self.ledger.record_failure(task.id, &message).await {
                    Ok(count) if count >= task.max_retries => {
                        if let Err(err) = self.ledger.exhaust_retries(task.id, &message).await {
                            tracing::warn!(id = %task.id, error = %err, "exhausted task not finalized");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(id = %task.id, error = %err, "failure not recorded, task left for a future poll");
                    }
                }
            }
        }
    }
}

/// Owns the bounded worker pool, the polling loop and per-task execution
/// orchestration. The handler registry is injected at construction.
pub struct Dispatcher {
    inner: Arc<Inner>,
    poll: Mutex<Option<PollLoop>>,
}

impl Dispatcher {
    /// Build a dispatcher. Fails fast on an invalid configuration.
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        config: DispatcherConfig,
    ) -> Result<Self, TaskmillError> {
        config.validate()?;
        let gate = AdmissionGate::new(config.concurrency, config.rate_interval, config.interval_cap);
        let ledger = Ledger::new(Arc::clone(&store));
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry,
                ledger,
                gate,
                config,
                running: AtomicBool::new(false),
                submitted: Mutex::new(HashSet::new()),
            }),
            poll: Mutex::new(None),
        })
    }

    /// Start the poll loop. No-op when already running.
    ///
    /// The loop is a single recurring timer; a cycle fully completes
    /// before the next tick fires, so poll cycles never overlap.
    pub async fn start(&self) {
        let mut poll = self.poll.lock().await;
        if poll.is_some() {
            return;
        }
        self.inner.running.store(true, Ordering::SeqCst);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.polling_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => Arc::clone(&inner).poll_once().await,
                }
            }
        });
        *poll = Some(PollLoop { shutdown, handle });
    }

    /// Stop polling and drain the admission gate. No-op when not running.
    ///
    /// In-flight handlers are never cancelled; this waits for them.
    pub async fn stop(&self) {
        let poll = { self.poll.lock().await.take() };
        let Some(poll) = poll else {
            return;
        };
        self.inner.running.store(false, Ordering::SeqCst);
        let _ = poll.shutdown.send(true);
        let _ = poll.handle.await;
        self.inner.gate.wait_idle().await;
    }

    /// Suspend new admissions. Polling continues; already-claimed tasks
    /// run to completion.
    pub fn pause(&self) {
        self.inner.gate.pause();
    }

    /// Allow admissions again.
    pub fn resume(&self) {
        self.inner.gate.resume();
    }

    /// Suspend until no executions are in flight and nothing is queued
    /// for admission. Does not stop polling.
    pub async fn wait_idle(&self) {
        self.inner.gate.wait_idle().await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Point-in-time snapshot; not transactionally consistent with the
    /// store.
    pub fn stats(&self) -> DispatcherStats {
        let gate = self.inner.gate.stats();
        DispatcherStats {
            queued: gate.queued,
            in_flight: gate.in_flight,
            paused: gate.paused,
            running: self.is_running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskStatus;
    use crate::registry::TaskHandler;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;
    use tokio::time::timeout;

    fn test_config() -> DispatcherConfig {
        DispatcherConfig {
            concurrency: 4,
            polling_interval: Duration::from_millis(20),
            rate_interval: Duration::from_millis(50),
            interval_cap: 100,
            batch_size: 10,
        }
    }

    fn dispatcher(
        store: Arc<MemoryStore>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> Dispatcher {
        Dispatcher::new(store, Arc::new(registry), config).unwrap()
    }

    /// Poll the store until `predicate` holds or two seconds pass.
    async fn wait_for<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                if predicate().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// Fails the first `n` executions, then succeeds.
    struct Flaky {
        failures_left: AtomicU32,
    }

    impl Flaky {
        fn new(n: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(n),
            }
        }
    }

    #[async_trait]
    impl TaskHandler for Flaky {
        async fn handle(&self, _payload: Value, _task: &Task) -> Result<(), TaskmillError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(TaskmillError::handler(format!("flaky failure (left={left})")));
            }
            Ok(())
        }
    }

    /// Fails every execution with a numbered message.
    struct AlwaysFails {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl TaskHandler for AlwaysFails {
        async fn handle(&self, _payload: Value, _task: &Task) -> Result<(), TaskmillError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            Err(TaskmillError::handler(format!("boom-{n}")))
        }
    }

    /// Records the names it executes, in order.
    struct Recorder {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, _payload: Value, task: &Task) -> Result<(), TaskmillError> {
            self.seen.lock().unwrap().push(task.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn completes_a_task_and_stamps_both_timestamps() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(Flaky::new(0)));
        let dispatcher = dispatcher(store.clone(), registry, test_config());

        let id = store.insert("ok", 0, "{}".into(), 3).await.unwrap();
        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move {
                store.get_by_id(id).await.unwrap().unwrap().status == TaskStatus::Completed
            }
        })
        .await;
        dispatcher.stop().await;

        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 0);
        let (started, completed) = (task.started_at.unwrap(), task.completed_at.unwrap());
        assert!(started <= completed);
    }

    #[tokio::test]
    async fn retries_then_completes() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("flaky", Arc::new(Flaky::new(2)));
        let dispatcher = dispatcher(store.clone(), registry, test_config());

        let id = store.insert("flaky", 0, "{}".into(), 3).await.unwrap();
        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move {
                store.get_by_id(id).await.unwrap().unwrap().status.is_terminal()
            }
        })
        .await;
        dispatcher.stop().await;

        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 2);
    }

    #[tokio::test]
    async fn exhausts_retries_and_keeps_last_error() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register(
            "doomed",
            Arc::new(AlwaysFails {
                attempts: AtomicU32::new(0),
            }),
        );
        let dispatcher = dispatcher(store.clone(), registry, test_config());

        let id = store.insert("doomed", 0, "{}".into(), 2).await.unwrap();
        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move {
                store.get_by_id(id).await.unwrap().unwrap().status == TaskStatus::Failed
            }
        })
        .await;
        dispatcher.stop().await;

        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_message.as_deref(), Some("boom-2"));
    }

    #[tokio::test]
    async fn missing_handler_takes_the_failure_path() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone(), HandlerRegistry::new(), test_config());

        let id = store.insert("ghost", 0, "{}".into(), 1).await.unwrap();
        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move {
                store.get_by_id(id).await.unwrap().unwrap().status == TaskStatus::Failed
            }
        })
        .await;
        dispatcher.stop().await;

        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(
            task.error_message.as_deref(),
            Some("no handler registered for task type: ghost")
        );
    }

    #[tokio::test]
    async fn executes_in_priority_order_with_one_slot() {
        let store = Arc::new(MemoryStore::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("low", Arc::new(Recorder { seen: seen.clone() }));
        registry.register("high", Arc::new(Recorder { seen: seen.clone() }));
        let mut config = test_config();
        config.concurrency = 1;
        let dispatcher = dispatcher(store.clone(), registry, config);

        // Inserted low first; the higher priority must still run first.
        store.insert("low", 50, "{}".into(), 3).await.unwrap();
        store.insert("high", 100, "{}".into(), 3).await.unwrap();

        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move { store.aggregate_counts().await.unwrap().completed == 2 }
        })
        .await;
        dispatcher.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_runs_oldest_first() {
        let store = Arc::new(MemoryStore::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry.register("first", Arc::new(Recorder { seen: seen.clone() }));
        registry.register("second", Arc::new(Recorder { seen: seen.clone() }));
        let mut config = test_config();
        config.concurrency = 1;
        let dispatcher = dispatcher(store.clone(), registry, config);

        store.insert("first", 10, "{}".into(), 3).await.unwrap();
        store.insert("second", 10, "{}".into(), 3).await.unwrap();

        dispatcher.start().await;
        wait_for(|| {
            let store = store.clone();
            async move { store.aggregate_counts().await.unwrap().completed == 2 }
        })
        .await;
        dispatcher.stop().await;

        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn paused_dispatcher_admits_nothing_until_resume() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(Flaky::new(0)));
        let dispatcher = dispatcher(store.clone(), registry, test_config());

        dispatcher.pause();
        let id = store.insert("ok", 0, "{}".into(), 3).await.unwrap();
        dispatcher.start().await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let stats = dispatcher.stats();
        assert!(stats.paused);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queued, 1);

        dispatcher.resume();
        wait_for(|| {
            let store = store.clone();
            async move {
                store.get_by_id(id).await.unwrap().unwrap().status == TaskStatus::Completed
            }
        })
        .await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn wait_idle_sees_the_batch_through() {
        let store = Arc::new(MemoryStore::new());
        let mut registry = HandlerRegistry::new();
        registry.register("ok", Arc::new(Flaky::new(0)));
        let dispatcher = dispatcher(store.clone(), registry, test_config());

        for _ in 0..5 {
            store.insert("ok", 0, "{}".into(), 3).await.unwrap();
        }
        dispatcher.start().await;

        // Give the first cycle time to submit, then drain.
        tokio::time::sleep(Duration::from_millis(30)).await;
        timeout(Duration::from_secs(2), dispatcher.wait_idle())
            .await
            .unwrap();

        let stats = dispatcher.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queued, 0);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_toggle_the_running_flag() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store, HandlerRegistry::new(), test_config());

        assert!(!dispatcher.is_running());
        dispatcher.start().await;
        assert!(dispatcher.is_running());
        dispatcher.start().await; // no-op
        assert!(dispatcher.is_running());

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());
        dispatcher.stop().await; // no-op
        assert!(!dispatcher.is_running());
    }

    #[tokio::test]
    async fn polling_survives_a_closed_store() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone(), HandlerRegistry::new(), test_config());

        store.close().await.unwrap();
        dispatcher.start().await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        // Query errors are logged and the loop keeps running.
        assert!(dispatcher.is_running());
        dispatcher.stop().await;
    }

    #[test]
    fn zero_concurrency_is_rejected_at_construction() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let config = DispatcherConfig {
            concurrency: 0,
            ..DispatcherConfig::default()
        };
        let Err(err) = Dispatcher::new(store, Arc::new(HandlerRegistry::new()), config) else {
            panic!("concurrency=0 must be rejected");
        };
        assert!(matches!(err, TaskmillError::Config(_)));
    }

    #[test]
    fn zero_interval_cap_is_rejected_at_construction() {
        let store: Arc<dyn TaskStore> = Arc::new(MemoryStore::new());
        let config = DispatcherConfig {
            interval_cap: 0,
            ..DispatcherConfig::default()
        };
        let Err(err) = Dispatcher::new(store, Arc::new(HandlerRegistry::new()), config) else {
            panic!("interval_cap=0 must be rejected");
        };
        assert!(matches!(err, TaskmillError::Config(_)));
    }
}
