//! Learning tasks: descriptors, lifecycle states and creation.

pub mod creator;
pub mod model;

pub use creator::{CreatedTask, ReplaySpec, TaskCreator, TaskRequest, ValidationWarning};
pub use model::{
    LearningStrategy, ResourceRequirements, StatusTransition, StrategyProfile, TaskDescriptor,
    TaskId, TaskStatus,
};
