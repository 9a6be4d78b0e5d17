//! Progress tracking for executing tasks.

pub mod context;
pub mod tracker;

pub use context::{
    ArchivedContext, ExecutionContext, ResourceUsage, StatusUpdate, TrackingOutcome,
};
pub use tracker::{ProgressTracker, StaleTask, TrackerStats};
