//! Handler registry: maps a task's declared type to an executable unit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::Task;
use crate::error::TaskmillError;

/// A handler for one task type.
///
/// Takes the decoded payload plus the full task record, so handlers can
/// read retry counts, priority or timestamps without another store
/// round-trip. No value is consumed on success; an `Err` is the failure
/// signal and its message is what the ledger records.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: Value, task: &Task) -> Result<(), TaskmillError>;
}

/// Registry of handlers (task name -> handler).
///
/// Design:
/// - Built during wiring (mutable), handed to the dispatcher as an `Arc`
///   (immutable). No locks at execution time.
/// - Registration overwrites: last registration for a name wins.
/// - Lookup is a pure read; absence is a normal condition the dispatcher
///   turns into a failure, not an error raised here.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
