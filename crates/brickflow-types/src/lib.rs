//! Shared domain types for brickflow.
//!
//! Workflow documents, brick configurations, execution results, event payloads
//! and engine configuration used across the brickflow workspace.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod brick;
pub mod config;
pub mod error;
pub mod event;
pub mod validation;
pub mod workflow;
