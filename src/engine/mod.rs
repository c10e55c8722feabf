//! Orchestration engine: admission, execution tasks, and maintenance.

pub mod maintenance;
pub mod orchestrator;

pub use maintenance::RetryReport;
pub use orchestrator::{EngineConfig, Orchestrator, SubmitResult};
