//! taskmill-core
//!
//! A persistent priority task queue: tasks are durably recorded through the
//! [`ports::TaskStore`] seam, claimed by a bounded pool of concurrent
//! workers in priority order, executed via pluggable handlers and retried
//! on failure up to a per-task limit.
//!
//! Module map:
//! - **domain**: task entity, status state machine, ids
//! - **ports**: the store seam the dispatcher and ledger run against
//! - **store**: in-memory reference implementation of the port
//! - **ledger**: the single authority for status/retry transitions
//! - **registry**: task name -> handler mapping
//! - **gate**: concurrency/rate-limited admission
//! - **dispatcher**: poll loop, worker pool, lifecycle surface

pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod ports;
pub mod registry;
pub mod stats;
pub mod store;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use domain::{Task, TaskId, TaskStatus};
pub use error::TaskmillError;
pub use gate::{AdmissionGate, GateStats};
pub use ledger::Ledger;
pub use ports::TaskStore;
pub use registry::{HandlerRegistry, TaskHandler};
pub use stats::{DispatcherStats, StoreCounts};
pub use store::MemoryStore;
