//! In-memory task store implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::domain::{Task, TaskId, TaskStatus};
use crate::error::TaskmillError;
use crate::ports::TaskStore;
use crate::stats::StoreCounts;

/// In-memory store state.
struct MemoryStoreState {
    /// All task rows (single source of truth).
    tasks: HashMap<TaskId, Task>,

    /// Next task id to assign.
    next_id: u64,

    closed: bool,
}

impl MemoryStoreState {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            next_id: 1,
            closed: false,
        }
    }

    fn allocate_id(&mut self) -> TaskId {
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn guard_open(&self) -> Result<(), TaskmillError> {
        if self.closed {
            return Err(TaskmillError::StoreClosed);
        }
        Ok(())
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut Task, TaskmillError> {
        self.tasks
            .get_mut(&id)
            .ok_or(TaskmillError::TaskNotFound(id))
    }
}

/// In-memory [`TaskStore`] for tests and single-process demos.
///
/// All operations run under one lock, so the trait's atomicity contract
/// (notably `increment_retry`) holds trivially.
pub struct MemoryStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryStoreState::new())),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert(
        &self,
        name: &str,
        priority: i32,
        payload: String,
        max_retries: u32,
    ) -> Result<TaskId, TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let id = state.allocate_id();
        let now = Utc::now();
        let task = Task {
            id,
            name: name.to_string(),
            priority,
            status: TaskStatus::Pending,
            payload,
            max_retries,
            retry_count: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        state.tasks.insert(id, task);
        Ok(id)
    }

    async fn query_pending(&self, limit: usize) -> Result<Vec<Task>, TaskmillError> {
        let state = self.state.lock().await;
        state.guard_open()?;

        let mut batch: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.retry_count < t.max_retries)
            .cloned()
            .collect();

        // Priority descending, then oldest-first. Ids are allocated in
        // creation order, so they break same-instant created_at ties.
        batch.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        batch.truncate(limit);
        Ok(batch)
    }

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>, TaskmillError> {
        let state = self.state.lock().await;
        state.guard_open()?;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let task = state.get_mut(id)?;
        task.status = status;
        if let Some(message) = error_message {
            task.error_message = Some(message.to_string());
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_started(&self, id: TaskId) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let now = Utc::now();
        let task = state.get_mut(id)?;
        task.status = TaskStatus::Processing;
        if task.started_at.is_none() {
            task.started_at = Some(now);
        }
        task.updated_at = now;
        Ok(())
    }

    async fn mark_completed(&self, id: TaskId) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let now = Utc::now();
        let task = state.get_mut(id)?;
        task.status = TaskStatus::Completed;
        if task.completed_at.is_none() {
            task.completed_at = Some(now);
        }
        task.updated_at = now;
        Ok(())
    }

    async fn increment_retry(
        &self,
        id: TaskId,
        error_message: &str,
    ) -> Result<u32, TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let task = state.get_mut(id)?;
        task.retry_count += 1;
        task.error_message = Some(error_message.to_string());
        task.status = TaskStatus::Pending;
        task.updated_at = Utc::now();
        Ok(task.retry_count)
    }

    async fn mark_failed(&self, id: TaskId, error_message: &str) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;

        let task = state.get_mut(id)?;
        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message.to_string());
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn aggregate_counts(&self) -> Result<StoreCounts, TaskmillError> {
        let state = self.state.lock().await;
        state.guard_open()?;

        let mut counts = StoreCounts::default();
        for task in state.tasks.values() {
            counts.total += 1;
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn clear_all(&self) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.guard_open()?;
        state.tasks.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), TaskmillError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        Ok(())
    }
}
