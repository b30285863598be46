//! Infrastructure layer for brickflow.
//!
//! Implements the ports defined in `brickflow-core`: an HTTP network client
//! on `reqwest`, a file-backed snapshot store, a directory-backed workflow
//! source, and the TOML engine configuration loader.

pub mod config;
pub mod http;
pub mod snapshot;
pub mod workflow_source;

pub use config::{load_engine_config, resolve_data_dir, resolve_storage_path};
pub use http::ReqwestNetworkClient;
pub use snapshot::FileSnapshotStore;
pub use workflow_source::{FileWorkflowSource, discover_workflows, load_workflow_file};
