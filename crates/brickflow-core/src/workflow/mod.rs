//! Workflow runtime: document loading and validation, checkpoints, and the
//! step state machine.
//!
//! - `loader` -- JSON parsing, structural validation, writer analysis, catalog
//! - `checkpoint` -- snapshot store port and coalescing checkpoint manager
//! - `engine` -- the orchestrator

pub mod checkpoint;
pub mod engine;
pub mod loader;

pub use checkpoint::{CheckpointError, CheckpointManager, InMemorySnapshotStore, SnapshotStore};
pub use engine::{EngineError, EngineUpdate, WorkflowEngine};
pub use loader::{WorkflowCatalog, WorkflowError, WorkflowSource, parse_workflow_json};
