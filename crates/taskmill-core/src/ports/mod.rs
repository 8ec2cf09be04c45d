//! Ports (trait seams for external collaborators).

pub mod task_store;

pub use task_store::TaskStore;
