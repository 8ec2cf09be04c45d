//! TaskStore port - the durable record of tasks (source of truth).
//!
//! The dispatcher and ledger only ever talk to this trait. A relational
//! implementation sits behind it in production; [`crate::store::MemoryStore`]
//! is the in-process reference used by tests and the demo binary.

use async_trait::async_trait;

use crate::domain::{Task, TaskId, TaskStatus};
use crate::error::TaskmillError;
use crate::stats::StoreCounts;

/// Durable task record store.
///
/// Contract notes:
/// - Every mutation refreshes `updated_at`.
/// - `increment_retry` is one logical update: retry count, error message
///   and the transition back to `pending` must land together, so a task is
///   never observable as neither retryable nor failed.
/// - After `close()` every operation fails with [`TaskmillError::StoreClosed`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `pending` task and return its id.
    async fn insert(
        &self,
        name: &str,
        priority: i32,
        payload: String,
        max_retries: u32,
    ) -> Result<TaskId, TaskmillError>;

    /// Up to `limit` claimable tasks: `status = pending AND
    /// retry_count < max_retries`, ordered by priority descending, then
    /// `created_at` ascending (oldest-first among equal priority).
    async fn query_pending(&self, limit: usize) -> Result<Vec<Task>, TaskmillError>;

    async fn get_by_id(&self, id: TaskId) -> Result<Option<Task>, TaskmillError>;

    /// Raw status update, optionally recording an error message.
    async fn update_status(
        &self,
        id: TaskId,
        status: TaskStatus,
        error_message: Option<&str>,
    ) -> Result<(), TaskmillError>;

    /// Status -> `processing`; `started_at` is set only if still unset.
    async fn mark_started(&self, id: TaskId) -> Result<(), TaskmillError>;

    /// Status -> `completed`; `completed_at` is set only if still unset.
    async fn mark_completed(&self, id: TaskId) -> Result<(), TaskmillError>;

    /// Increment `retry_count`, record the error message and put the task
    /// back to `pending`, all as one update. Returns the new count.
    async fn increment_retry(
        &self,
        id: TaskId,
        error_message: &str,
    ) -> Result<u32, TaskmillError>;

    /// Status -> `failed` with the final error message.
    async fn mark_failed(&self, id: TaskId, error_message: &str) -> Result<(), TaskmillError>;

    async fn aggregate_counts(&self) -> Result<StoreCounts, TaskmillError>;

    /// Bulk-remove all rows. Outside the normal lifecycle; tasks are never
    /// deleted by claim/success/failure transitions.
    async fn clear_all(&self) -> Result<(), TaskmillError>;

    async fn close(&self) -> Result<(), TaskmillError>;
}
