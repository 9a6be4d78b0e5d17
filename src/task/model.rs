//! Task descriptor and its lifecycle state machine.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ScheduleError, ValidationError};

/// Globally unique task identifier: `lt-<unix millis>-<12 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id. The random suffix carries 48 bits of UUID v4
    /// entropy, so concurrent creators need no coordination.
    pub fn generate(now: DateTime<Utc>) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("lt-{}-{}", now.timestamp_millis(), &suffix[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Learning strategy a task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStrategy {
    Incremental,
    Continual,
    Reinforcement,
    Transfer,
    MetaLearning,
    Federated,
}

/// Per-strategy defaults and cost multipliers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyProfile {
    pub min_batch: u32,
    pub max_batch: u32,
    pub default_batch: u32,
    pub duration_multiplier: f64,
    pub cpu_multiplier: f64,
    pub memory_multiplier: f64,
    pub gpu_count: u32,
}

impl LearningStrategy {
    pub const ALL: [LearningStrategy; 6] = [
        Self::Incremental,
        Self::Continual,
        Self::Reinforcement,
        Self::Transfer,
        Self::MetaLearning,
        Self::Federated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incremental => "incremental",
            Self::Continual => "continual",
            Self::Reinforcement => "reinforcement",
            Self::Transfer => "transfer",
            Self::MetaLearning => "meta_learning",
            Self::Federated => "federated",
        }
    }

    pub fn profile(&self) -> StrategyProfile {
        let (min_batch, max_batch, default_batch, duration, cpu, memory, gpu) = match self {
            Self::Incremental => (8, 512, 32, 1.0, 1.0, 1.0, 0),
            Self::Continual => (16, 1024, 64, 1.5, 1.5, 2.0, 0),
            Self::Reinforcement => (32, 4096, 256, 3.0, 2.0, 1.5, 1),
            Self::Transfer => (8, 256, 16, 2.0, 2.0, 4.0, 1),
            Self::MetaLearning => (4, 128, 16, 4.0, 3.0, 3.0, 1),
            Self::Federated => (16, 2048, 128, 2.5, 1.0, 1.0, 0),
        };
        StrategyProfile {
            min_batch,
            max_batch,
            default_batch,
            duration_multiplier: duration,
            cpu_multiplier: cpu,
            memory_multiplier: memory,
            gpu_count: gpu,
        }
    }
}

impl FromStr for LearningStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownStrategy(s.to_string()))
    }
}

impl fmt::Display for LearningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet queued.
    Pending,
    /// Waiting in the scheduler queue.
    Scheduled,
    /// Handed to a worker.
    Assigned,
    /// The executor has reported progress.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Assigned|Running → Scheduled` is the only backward edge; it is taken
    /// when the worker holding the task is lost.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Scheduled) | (Pending, Cancelled) | (Pending, Failed) |
            (Scheduled, Assigned) | (Scheduled, Cancelled) | (Scheduled, Failed) |
            (Assigned, Running) | (Assigned, Completed) | (Assigned, Failed) |
            (Assigned, Cancelled) | (Assigned, Scheduled) |
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) | (Running, Scheduled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Held by a worker.
    pub fn is_assigned(&self) -> bool {
        matches!(self, Self::Assigned | Self::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A status transition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Resources a task needs from its worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub gpu_count: u32,
}

impl Default for ResourceRequirements {
    fn default() -> Self {
        Self {
            cpu_cores: 1.0,
            memory_mb: 1024,
            gpu_count: 0,
        }
    }
}

const MAX_TRANSITIONS: usize = 50;

/// Declarative record of one unit of adaptive-computation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub target_id: String,
    pub strategy: LearningStrategy,
    /// Normalized task parameters (defaults applied).
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resource_requirements: ResourceRequirements,
    pub estimated_duration: Duration,
    pub dependencies: BTreeSet<TaskId>,
    pub failure_reason: Option<String>,
    pub transitions: Vec<StatusTransition>,
}

impl TaskDescriptor {
    pub fn new(
        task_id: TaskId,
        target_id: impl Into<String>,
        strategy: LearningStrategy,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            target_id: target_id.into(),
            strategy,
            parameters: serde_json::Map::new(),
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            resource_requirements: ResourceRequirements::default(),
            estimated_duration: Duration::ZERO,
            dependencies: BTreeSet::new(),
            failure_reason: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new status at `now`.
    pub fn transition_at(
        &mut self,
        new_status: TaskStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        if !self.status.can_transition_to(new_status) {
            return Err(ScheduleError::InvalidTransition {
                id: self.task_id.clone(),
                state: self.status.to_string(),
                target: new_status.to_string(),
            });
        }

        self.transitions.push(StatusTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
            reason: reason.clone(),
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;

        match new_status {
            TaskStatus::Assigned if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            TaskStatus::Failed => {
                self.failure_reason = reason;
                self.completed_at = Some(now);
            }
            TaskStatus::Completed | TaskStatus::Cancelled => {
                self.completed_at = Some(now);
            }
            _ => {}
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor::new(
            TaskId::from("lt-1-abc"),
            "model-a",
            LearningStrategy::Incremental,
            Utc::now(),
        )
    }

    #[test]
    fn transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Scheduled));
        assert!(TaskStatus::Scheduled.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Assigned.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Scheduled));
    }

    #[test]
    fn transitions_invalid() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Scheduled));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Scheduled.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Assigned));
    }

    #[test]
    fn descriptor_timestamps_follow_transitions() {
        let mut task = descriptor();
        let now = Utc::now();
        task.transition_at(TaskStatus::Scheduled, None, now).unwrap();
        assert!(task.started_at.is_none());
        task.transition_at(TaskStatus::Assigned, None, now).unwrap();
        assert_eq!(task.started_at, Some(now));
        task.transition_at(TaskStatus::Failed, Some("boom".into()), now)
            .unwrap();
        assert_eq!(task.failure_reason.as_deref(), Some("boom"));
        assert!(task.completed_at.is_some());

        let err = task
            .transition_at(TaskStatus::Scheduled, None, now)
            .unwrap_err();
        assert!(matches!(err, ScheduleError::InvalidTransition { .. }));
    }

    #[test]
    fn transition_history_capped() {
        let mut task = descriptor();
        let now = Utc::now();
        task.transition_at(TaskStatus::Scheduled, None, now).unwrap();
        for _ in 0..100 {
            task.transition_at(TaskStatus::Assigned, None, now).unwrap();
            task.transition_at(TaskStatus::Scheduled, Some("requeue".into()), now)
                .unwrap();
        }
        assert_eq!(task.transitions.len(), MAX_TRANSITIONS);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(
            "Meta-Learning".parse::<LearningStrategy>().unwrap(),
            LearningStrategy::MetaLearning
        );
        assert!(matches!(
            "alchemy".parse::<LearningStrategy>(),
            Err(ValidationError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn task_ids_are_unique() {
        let now = Utc::now();
        let a = TaskId::generate(now);
        let b = TaskId::generate(now);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with(&format!("lt-{}-", now.timestamp_millis())));
    }

    #[test]
    fn status_serde() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
