//! Observability setup for brickflow: tracing subscriber installation and
//! the optional OpenTelemetry bridge.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
