//! Retry/status ledger: the single authority for task state transitions.

use std::sync::Arc;

use crate::domain::{TaskId, TaskStatus};
use crate::error::TaskmillError;
use crate::ports::TaskStore;

/// Translates execution outcomes into status transitions and retry
/// bookkeeping on top of the store's raw update operations.
///
/// Design:
/// - "Increment and re-queue" and "finalize as failed" are two separate
///   store operations. Between them a task can sit at `pending` with
///   `retry_count == max_retries`; the polling predicate
///   (`retry_count < max_retries`) keeps it unclaimable in that window.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn TaskStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Claim a pending task: status -> `processing`, `started_at` set on
    /// first claim.
    ///
    /// Errors with [`TaskmillError::InvalidTransition`] if the task is not
    /// currently `pending`. Under a single dispatcher that means two
    /// executions raced for the same task, which the caller must surface,
    /// not swallow.
    pub async fn claim(&self, id: TaskId) -> Result<(), TaskmillError> {
        let task = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(TaskmillError::TaskNotFound(id))?;

        if task.status != TaskStatus::Pending {
            return Err(TaskmillError::InvalidTransition {
                id,
                expected: TaskStatus::Pending,
                actual: task.status,
            });
        }

        self.store.mark_started(id).await
    }

    /// Record a successful execution: status -> `completed`.
    ///
    /// A no-op on an already-terminal task, so a double invocation never
    /// moves `completed_at`.
    pub async fn record_success(&self, id: TaskId) -> Result<(), TaskmillError> {
        let task = self
            .store
            .get_by_id(id)
            .await?
            .ok_or(TaskmillError::TaskNotFound(id))?;

        if task.status.is_terminal() {
            return Ok(());
        }

        self.store.mark_completed(id).await
    }

    /// Record a failed execution: one logical update incrementing
    /// `retry_count`, storing the message and putting the task back to
    /// `pending`. Returns the new count.
    pub async fn record_failure(
        &self,
        id: TaskId,
        error_message: &str,
    ) -> Result<u32, TaskmillError> {
        self.store.increment_retry(id, error_message).await
    }

    /// Finalize a task whose retries are used up: status -> `failed`.
    ///
    /// Called by the dispatcher right after [`Ledger::record_failure`]
    /// returns a count that reached the task's `max_retries`.
    pub async fn exhaust_retries(
        &self,
        id: TaskId,
        error_message: &str,
    ) -> Result<(), TaskmillError> {
        self.store.mark_failed(id, error_message).await
    }
}
