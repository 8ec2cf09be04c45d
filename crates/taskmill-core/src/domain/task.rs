//! Task entity and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::TaskId;

/// Task status (persisted).
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (failure with retries left)
/// - Pending -> Processing -> Failed (failure with retries exhausted)
///
/// No transition leaves Completed or Failed. The ledger is the only
/// component allowed to drive these transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed by the dispatcher.
    Pending,

    /// Claimed and currently executing.
    Processing,

    /// Finished successfully (terminal).
    Completed,

    /// Retries exhausted (terminal).
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(()),
        }
    }
}

/// A unit of work, as persisted by the task store.
///
/// `name` selects the handler, `priority` orders claiming (higher first),
/// `payload` is opaque serialized data the handler interprets. Everything
/// except `status`, `retry_count`, `error_message` and the timestamps is
/// immutable after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub priority: i32,
    pub status: TaskStatus,
    pub payload: String,
    pub max_retries: u32,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Best-effort payload decode.
    ///
    /// Attempts a structured JSON parse; if the payload is not valid JSON
    /// the raw string is handed through unchanged. Handlers always get a
    /// value, never a decode error.
    pub fn payload_value(&self) -> Value {
        serde_json::from_str(&self.payload)
            .unwrap_or_else(|_| Value::String(self.payload.clone()))
    }
}
