//! Error types for the orchestration core.

use crate::task::TaskId;

/// Top-level error type for the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Hard violations found while validating a task request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Unknown learning strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown replay policy: {0}")]
    UnknownReplayPolicy(String),

    #[error("Field {field} has the wrong type: expected {expected}")]
    WrongType { field: String, expected: String },

    #[error("Field {field} out of bounds: {value} not in [{min}, {max}]")]
    OutOfBounds {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },
}

/// Scheduler errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScheduleError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} is already scheduled")]
    AlreadyScheduled { id: TaskId },

    #[error("Task {id} depends on unknown task {dependency}")]
    UnknownDependency { id: TaskId, dependency: TaskId },

    #[error("Task {id} cannot depend on itself")]
    SelfDependency { id: TaskId },

    #[error("Task {id} in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: TaskId,
        state: String,
        target: String,
    },

    #[error("Queue is full ({max} entries)")]
    QueueFull { max: usize },

    #[error("Worker {worker_id} not registered")]
    UnknownWorker { worker_id: String },

    #[error("Worker {worker_id} is already registered")]
    WorkerExists { worker_id: String },
}

/// Progress tracking errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrackingError {
    #[error("No active execution context for task {id}")]
    NotFound { id: TaskId },

    #[error("Task {id} is already tracked")]
    AlreadyTracked { id: TaskId },

    #[error("Maximum active contexts ({max}) exceeded")]
    CapacityExceeded { max: usize },
}

/// Memory buffer errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("Buffer capacity must be at least 1")]
    ZeroCapacity,

    #[error("Buffer holds {size} samples, above capacity {capacity}")]
    CapacityExceeded { size: usize, capacity: usize },
}

/// Task store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend failure: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
