//! Workflow orchestration engine for brickflow.
//!
//! This crate owns the runtime: the event bus that couples bricks to each
//! other and to the orchestrator, the shared workflow data store, template
//! interpolation, validation, the brick registry and built-in bricks, and the
//! step state machine. It also defines the ports (`NetworkClient`,
//! `SnapshotStore`, `WorkflowSource`) that `brickflow-infra` implements.
//! It depends only on `brickflow-types` -- never on `brickflow-infra`.

pub mod brick;
pub mod data;
pub mod event;
pub mod expression;
pub mod network;
pub mod template;
pub mod validation;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
