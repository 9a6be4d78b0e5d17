//! Scheduling: priority tiers with aging, dependency gating, and best-fit
//! assignment onto a registry of heartbeating workers.

pub mod engine;
pub mod priority;
pub mod worker;

pub use engine::{
    Assignment, AssignmentRound, CancelOutcome, LossOutcome, Promotion, REPEATED_WORKER_LOSS,
    SchedulerStats, TaskScheduler, TickReport, Unassigned, UnassignedReason, WorkerLoss,
};
pub use priority::{ScheduleEntry, TaskPriority};
pub use worker::{ResourceCapacity, WorkerRecord, fit_score};
