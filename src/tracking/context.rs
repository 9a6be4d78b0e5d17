//! Execution context: the live progress view of one task.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskId;

/// Phase a fresh context starts in.
pub const PHASE_INITIALIZING: &str = "initializing";
pub const PHASE_COMPLETED: &str = "completed";
pub const PHASE_FAILED: &str = "failed";
pub const PHASE_CANCELLED: &str = "cancelled";
pub const PHASE_REQUEUED: &str = "requeued";

/// Last resource usage an executor reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_mb: u64,
    pub gpu_percent: f64,
}

/// One entry in a context's status log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub timestamp: DateTime<Utc>,
    pub progress: f64,
    pub phase: String,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub worker_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    /// Always within [0, 100].
    pub progress_percent: f64,
    pub current_phase: String,
    pub resource_usage: ResourceUsage,
    /// Append-only, oldest entries dropped past the configured bound.
    pub status_updates: VecDeque<StatusUpdate>,
    pub stale: bool,
    pub error: Option<String>,
}

impl ExecutionContext {
    pub fn new(task_id: TaskId, worker_id: Option<String>, now: DateTime<Utc>) -> Self {
        Self {
            task_id,
            worker_id,
            started_at: now,
            last_heartbeat: now,
            progress_percent: 0.0,
            current_phase: PHASE_INITIALIZING.to_string(),
            resource_usage: ResourceUsage::default(),
            status_updates: VecDeque::new(),
            stale: false,
            error: None,
        }
    }

    /// Apply a progress report. NaN is treated as 0; other values clamp to [0, 100].
    pub(crate) fn apply_update(
        &mut self,
        percent: f64,
        phase: impl Into<String>,
        details: Option<serde_json::Value>,
        max_updates: usize,
        now: DateTime<Utc>,
    ) {
        let progress = clamp_percent(percent);
        let phase = phase.into();

        self.progress_percent = progress;
        self.current_phase = phase.clone();
        self.last_heartbeat = now;
        self.stale = false;
        self.push_update(
            StatusUpdate {
                timestamp: now,
                progress,
                phase,
                details,
            },
            max_updates,
        );
    }

    pub(crate) fn push_update(&mut self, update: StatusUpdate, max_updates: usize) {
        self.status_updates.push_back(update);
        while self.status_updates.len() > max_updates.max(1) {
            self.status_updates.pop_front();
        }
    }

    pub fn since_heartbeat(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_heartbeat).to_std().unwrap_or_default()
    }
}

pub fn clamp_percent(percent: f64) -> f64 {
    if percent.is_nan() {
        0.0
    } else {
        percent.clamp(0.0, 100.0)
    }
}

/// How a tracked task ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrackingOutcome {
    Completed,
    Failed { reason: String },
    Cancelled,
}

/// A finished context kept for later lookups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedContext {
    pub context: ExecutionContext,
    pub outcome: TrackingOutcome,
    pub archived_at: DateTime<Utc>,
}
