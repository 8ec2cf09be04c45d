use thiserror::Error;

use crate::domain::{TaskId, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("{id}: expected status {expected}, found {actual}")]
    InvalidTransition {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    /// Handler-reported failure. Expected, drives the retry path.
    #[error("{0}")]
    Handler(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("store is closed")]
    StoreClosed,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TaskmillError {
    /// Convenience constructor for handler failures.
    pub fn handler(message: impl Into<String>) -> Self {
        TaskmillError::Handler(message.into())
    }
}
