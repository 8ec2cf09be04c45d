use serde::{Deserialize, Serialize};

/// Aggregate task counts by status, as reported by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Point-in-time snapshot of the dispatcher.
///
/// Not transactionally consistent with the store: counters may move
/// between reading the gate and reading the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Submitted but not yet admitted into a concurrency slot.
    pub queued: usize,
    /// Currently executing.
    pub in_flight: usize,
    pub paused: bool,
    pub running: bool,
}
