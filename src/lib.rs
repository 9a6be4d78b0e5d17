//! Learning orchestrator: task creation, priority scheduling, progress
//! tracking and replay memory for adaptive-computation workloads.

pub mod config;
pub mod error;
pub mod memory;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod tracking;

pub use config::OrchestratorConfig;
pub use error::{Error, Result};
pub use orchestrator::{HealthReport, HealthStatus, LifecycleOutcome, Orchestrator};
