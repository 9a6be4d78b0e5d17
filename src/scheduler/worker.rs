//! Worker records and best-fit scoring.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{LearningStrategy, ResourceRequirements, TaskId};

/// Bonus for a worker whose capacity equals the requirement exactly.
const EXACT_MATCH_BONUS: f64 = 0.5;
/// Bonus for a worker advertising the task's strategy as a capability.
const CAPABILITY_BONUS: f64 = 0.25;

/// Resources a worker offers. Supplied at registration and trusted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCapacity {
    pub cpu_cores: f64,
    pub memory_mb: u64,
    pub gpu_count: u32,
}

impl ResourceCapacity {
    pub fn new(cpu_cores: f64, memory_mb: u64, gpu_count: u32) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            gpu_count,
        }
    }

    pub fn satisfies(&self, req: &ResourceRequirements) -> bool {
        self.cpu_cores >= req.cpu_cores
            && self.memory_mb >= req.memory_mb
            && self.gpu_count >= req.gpu_count
    }

    pub fn is_exact_match(&self, req: &ResourceRequirements) -> bool {
        (self.cpu_cores - req.cpu_cores).abs() < 1e-9
            && self.memory_mb == req.memory_mb
            && self.gpu_count == req.gpu_count
    }
}

/// A registered executor slot.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub available: bool,
    pub capabilities: BTreeSet<String>,
    pub resource_capacity: ResourceCapacity,
    pub current_task_id: Option<TaskId>,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub tasks_completed: u64,
}

impl WorkerRecord {
    pub fn new(
        worker_id: impl Into<String>,
        resource_capacity: ResourceCapacity,
        capabilities: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            available: true,
            capabilities: capabilities.into_iter().collect(),
            resource_capacity,
            current_task_id: None,
            last_heartbeat: now,
            registered_at: now,
            tasks_completed: 0,
        }
    }

    /// Occupy the slot. `current_task_id` is set iff the worker is unavailable.
    pub(crate) fn occupy(&mut self, task_id: TaskId) {
        self.current_task_id = Some(task_id);
        self.available = false;
    }

    /// Free the slot, returning the task it held.
    pub(crate) fn release(&mut self) -> Option<TaskId> {
        self.available = true;
        self.current_task_id.take()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.idle_for(now) > timeout
    }
}

/// Score how well `worker` fits a task. `None` when any hard resource
/// constraint is unmet; otherwise higher is better.
pub fn fit_score(
    worker: &WorkerRecord,
    req: &ResourceRequirements,
    strategy: LearningStrategy,
) -> Option<f64> {
    let capacity = &worker.resource_capacity;
    if !capacity.satisfies(req) {
        return None;
    }

    let slack = |have: f64, need: f64| {
        if have <= 0.0 { 0.0 } else { (have - need) / have }
    };
    let waste = (slack(capacity.cpu_cores, req.cpu_cores)
        + slack(capacity.memory_mb as f64, req.memory_mb as f64)
        + slack(f64::from(capacity.gpu_count), f64::from(req.gpu_count)))
        / 3.0;

    let mut score = 1.0 - waste;
    if capacity.is_exact_match(req) {
        score += EXACT_MATCH_BONUS;
    }
    if worker.capabilities.contains(strategy.as_str()) {
        score += CAPABILITY_BONUS;
    }
    Some(score)
}
