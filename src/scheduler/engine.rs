//! Task scheduler: priority queue, dependency gating, worker registry.
//!
//! All mutable scheduling state (queue, entries, worker registry) lives in one
//! [`SchedulerState`] behind a single mutex, so schedule/assign/cancel calls
//! never interleave. The periodic tick is three passes over that state:
//! aging, worker expiry, then auto-assignment.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::SchedulerConfig;
use crate::error::ScheduleError;
use crate::scheduler::priority::{PriorityQueue, QueueKey, ScheduleEntry, TaskPriority};
use crate::scheduler::worker::{ResourceCapacity, WorkerRecord, fit_score};
use crate::task::{TaskDescriptor, TaskId, TaskStatus};

/// Reason carried by a task failed after too many worker losses.
pub const REPEATED_WORKER_LOSS: &str = "repeated worker loss";

/// A task handed to a worker during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub worker_id: String,
    pub priority: TaskPriority,
    pub score: f64,
}

/// Why an eligible entry was left in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnassignedReason {
    /// No free worker meets the hard resource constraints.
    NoEligibleWorker,
}

impl fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoEligibleWorker => write!(f, "no eligible worker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unassigned {
    pub task_id: TaskId,
    pub reason: UnassignedReason,
}

/// Aging promotion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Promotion {
    pub task_id: TaskId,
    pub from: TaskPriority,
    pub to: TaskPriority,
}

/// What happened to the task a lost worker held.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LossOutcome {
    /// The worker held nothing.
    Idle,
    /// The task went back to the queue.
    Requeued { task_id: TaskId, requeue_count: u32 },
    /// The task exceeded its requeue budget.
    Failed { task_id: TaskId },
    /// The worker held a cancelled task whose stop was never acknowledged.
    StopReleased { task_id: TaskId },
}

/// A worker removed for missing heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerLoss {
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub outcome: LossOutcome,
}

/// Everything one auto-assignment pass decided.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignmentRound {
    pub assigned: Vec<Assignment>,
    pub unassigned: Vec<Unassigned>,
    /// Entries cycled to the back of their tier on unmet dependencies.
    pub deferred: Vec<TaskId>,
    /// Entries failed because a dependency failed or was cancelled.
    pub dependency_failures: Vec<TaskId>,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub promotions: Vec<Promotion>,
    pub lost_workers: Vec<WorkerLoss>,
    pub round: AssignmentRound,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CancelOutcome {
    /// Removed from the queue.
    Cancelled,
    /// Cancelled while held by a worker; the slot frees on acknowledgement.
    StopRequested { worker_id: String },
    /// Already cancelled; nothing changed.
    AlreadyCancelled,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub assigned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub queued_by_priority: BTreeMap<TaskPriority, usize>,
    pub workers_total: usize,
    pub workers_available: usize,
    pub workers_lost: u64,
    pub requeues: u64,
    pub max_queue_size: usize,
}

enum DependencyState {
    Ready,
    Waiting,
    Broken(TaskId),
}

#[derive(Debug, Default)]
struct SchedulerState {
    entries: HashMap<TaskId, ScheduleEntry>,
    queue: PriorityQueue,
    /// Tasks currently Scheduled; a heap key is live only if its task is here.
    queued: HashSet<TaskId>,
    workers: BTreeMap<String, WorkerRecord>,
    workers_lost: u64,
    requeues: u64,
}

impl SchedulerState {
    fn is_live(&self, key: &QueueKey) -> bool {
        self.queued.contains(&key.task_id)
            && self
                .entries
                .get(&key.task_id)
                .is_some_and(|e| e.sequence == key.sequence)
    }

    fn enqueue(&mut self, task_id: &TaskId, fresh_sequence: bool) {
        let Some(entry) = self.entries.get_mut(task_id) else {
            return;
        };
        if fresh_sequence {
            entry.sequence = self.queue.next_sequence();
        }
        self.queue
            .push(task_id.clone(), entry.priority, entry.sequence);
        self.queued.insert(task_id.clone());
    }

    /// Rebuild the heap from live entries, dropping stale keys.
    fn rebuild_queue(&mut self) {
        let keys = self
            .queued
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| QueueKey {
                rank: e.priority.rank(),
                sequence: e.sequence,
                task_id: e.task_id().clone(),
            })
            .collect();
        self.queue.rebuild(keys);
    }

    fn dependency_state(&self, dependencies: &BTreeSet<TaskId>) -> DependencyState {
        let mut waiting = false;
        for dep in dependencies {
            match self.entries.get(dep).map(|e| e.status()) {
                Some(TaskStatus::Completed) => {}
                Some(TaskStatus::Failed) | Some(TaskStatus::Cancelled) => {
                    return DependencyState::Broken(dep.clone());
                }
                _ => waiting = true,
            }
        }
        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Ready
        }
    }

    /// Free the worker holding `task_id`, if any.
    fn release_worker_of(&mut self, task_id: &TaskId) -> Option<String> {
        let worker_id = self.entries.get_mut(task_id)?.assigned_worker.take()?;
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if worker.current_task_id.as_ref() == Some(task_id) {
                worker.release();
            }
        }
        Some(worker_id)
    }

    /// Return the task held by a departing worker to the queue, or fail it
    /// once its requeue budget is spent.
    fn recover_task(
        &mut self,
        task_id: TaskId,
        count_loss: bool,
        max_requeues: u32,
        now: DateTime<Utc>,
    ) -> LossOutcome {
        let Some(entry) = self.entries.get_mut(&task_id) else {
            return LossOutcome::Idle;
        };
        entry.assigned_worker = None;

        if entry.status() == TaskStatus::Cancelled {
            entry.cancel_requested = false;
            return LossOutcome::StopReleased { task_id };
        }
        if !entry.status().is_assigned() {
            return LossOutcome::Idle;
        }

        if count_loss {
            entry.requeue_count += 1;
        }
        if entry.requeue_count > max_requeues {
            let _ = entry.descriptor.transition_at(
                TaskStatus::Failed,
                Some(REPEATED_WORKER_LOSS.to_string()),
                now,
            );
            return LossOutcome::Failed { task_id };
        }

        let requeue_count = entry.requeue_count;
        let _ = entry.descriptor.transition_at(
            TaskStatus::Scheduled,
            Some("worker lost, requeued".to_string()),
            now,
        );
        self.requeues += 1;
        // keeps its original sequence, so it resumes its place in the tier
        self.enqueue(&task_id, false);
        LossOutcome::Requeued {
            task_id,
            requeue_count,
        }
    }
}

/// The single scheduling authority.
pub struct TaskScheduler {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Queue ───────────────────────────────────────────────────────────

    /// Enqueue a descriptor. `dependencies` is merged with the descriptor's own.
    pub async fn schedule(
        &self,
        descriptor: TaskDescriptor,
        priority: TaskPriority,
        dependencies: impl IntoIterator<Item = TaskId>,
    ) -> Result<(), ScheduleError> {
        self.schedule_at(descriptor, priority, dependencies, Utc::now())
            .await
    }

    pub async fn schedule_at(
        &self,
        mut descriptor: TaskDescriptor,
        priority: TaskPriority,
        dependencies: impl IntoIterator<Item = TaskId>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        descriptor.dependencies.extend(dependencies);
        let task_id = descriptor.task_id.clone();

        let mut state = self.state.lock().await;

        if state.entries.contains_key(&task_id) {
            return Err(ScheduleError::AlreadyScheduled { id: task_id });
        }
        if descriptor.dependencies.contains(&task_id) {
            return Err(ScheduleError::SelfDependency { id: task_id });
        }
        if let Some(missing) = descriptor
            .dependencies
            .iter()
            .find(|dep| !state.entries.contains_key(*dep))
        {
            return Err(ScheduleError::UnknownDependency {
                id: task_id,
                dependency: missing.clone(),
            });
        }
        if state.queued.len() >= self.config.max_queue_size {
            return Err(ScheduleError::QueueFull {
                max: self.config.max_queue_size,
            });
        }

        descriptor.transition_at(TaskStatus::Scheduled, Some(format!("queued at {priority}")), now)?;

        let entry = ScheduleEntry {
            descriptor,
            priority,
            original_priority: priority,
            scheduled_at: now,
            last_promoted_at: now,
            sequence: 0,
            requeue_count: 0,
            assigned_worker: None,
            cancel_requested: false,
        };
        state.entries.insert(task_id.clone(), entry);
        state.enqueue(&task_id, true);

        tracing::info!(task_id = %task_id, priority = %priority, "Task scheduled");
        Ok(())
    }

    /// Cancel a task. Cancelling an already-cancelled task succeeds.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<CancelOutcome, ScheduleError> {
        self.cancel_at(task_id, Utc::now()).await
    }

    pub async fn cancel_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<CancelOutcome, ScheduleError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;

        if entry.status() == TaskStatus::Cancelled {
            return Ok(CancelOutcome::AlreadyCancelled);
        }

        let was_assigned = entry.status().is_assigned();
        entry
            .descriptor
            .transition_at(TaskStatus::Cancelled, Some("cancelled".to_string()), now)?;

        if was_assigned {
            entry.cancel_requested = true;
            let worker_id = entry.assigned_worker.clone().unwrap_or_default();
            tracing::info!(task_id = %task_id, worker_id = %worker_id, "Stop requested for cancelled task");
            return Ok(CancelOutcome::StopRequested { worker_id });
        }

        state.queued.remove(task_id);
        tracing::info!(task_id = %task_id, "Queued task cancelled");
        Ok(CancelOutcome::Cancelled)
    }

    /// The executor confirmed it stopped a cancelled task; free its worker.
    pub async fn acknowledge_stop(&self, task_id: &TaskId) -> Result<(), ScheduleError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;
        if !entry.cancel_requested {
            return Err(ScheduleError::InvalidTransition {
                id: task_id.clone(),
                state: entry.status().to_string(),
                target: "stop acknowledged".to_string(),
            });
        }
        entry.cancel_requested = false;
        if let Some(worker_id) = state.release_worker_of(task_id) {
            tracing::info!(task_id = %task_id, worker_id = %worker_id, "Stop acknowledged, worker freed");
        }
        Ok(())
    }

    /// The executor reported its first progress.
    pub async fn mark_running(&self, task_id: &TaskId) -> Result<(), ScheduleError> {
        self.mark_running_at(task_id, Utc::now()).await
    }

    pub async fn mark_running_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;
        match entry.status() {
            TaskStatus::Running => Ok(()),
            _ => entry
                .descriptor
                .transition_at(TaskStatus::Running, None, now),
        }
    }

    /// An executor reported progress: mark the task Running and count the
    /// report as a heartbeat from its worker. Returns whether a stop was
    /// requested for the task.
    pub async fn record_progress_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<bool, ScheduleError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;

        if entry.status() == TaskStatus::Assigned {
            entry
                .descriptor
                .transition_at(TaskStatus::Running, None, now)?;
        } else if !entry.cancel_requested && entry.status() != TaskStatus::Running {
            return Err(ScheduleError::InvalidTransition {
                id: task_id.clone(),
                state: entry.status().to_string(),
                target: TaskStatus::Running.to_string(),
            });
        }

        let stop_requested = entry.cancel_requested;
        if let Some(worker_id) = entry.assigned_worker.clone() {
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                if now > worker.last_heartbeat {
                    worker.last_heartbeat = now;
                }
            }
        }
        Ok(stop_requested)
    }

    pub async fn complete(&self, task_id: &TaskId) -> Result<(), ScheduleError> {
        self.complete_at(task_id, Utc::now()).await
    }

    /// Mark an assigned task Completed and free its worker. A completion
    /// report for a cancelled task acknowledges its stop instead.
    pub async fn complete_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        self.finish(task_id, TaskStatus::Completed, None, now).await
    }

    pub async fn fail(&self, task_id: &TaskId, reason: impl Into<String>) -> Result<(), ScheduleError> {
        self.fail_at(task_id, reason, Utc::now()).await
    }

    /// Mark a task Failed. Queued tasks may fail too (e.g. rejected upstream).
    pub async fn fail_at(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        self.finish(task_id, TaskStatus::Failed, Some(reason.into()), now)
            .await
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        target: TaskStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut state = self.state.lock().await;
        let entry = state
            .entries
            .get_mut(task_id)
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;

        if entry.cancel_requested {
            entry.cancel_requested = false;
            state.release_worker_of(task_id);
            tracing::info!(task_id = %task_id, "Cancelled task stopped by executor");
            return Ok(());
        }

        if target == TaskStatus::Completed && !entry.status().is_assigned() {
            return Err(ScheduleError::InvalidTransition {
                id: task_id.clone(),
                state: entry.status().to_string(),
                target: target.to_string(),
            });
        }
        entry.descriptor.transition_at(target, reason.clone(), now)?;

        state.queued.remove(task_id);
        if let Some(worker_id) = state.release_worker_of(task_id) {
            if target == TaskStatus::Completed {
                if let Some(worker) = state.workers.get_mut(&worker_id) {
                    worker.tasks_completed += 1;
                }
            }
        }

        match target {
            TaskStatus::Failed => tracing::warn!(
                task_id = %task_id,
                reason = reason.as_deref().unwrap_or("unspecified"),
                "Task failed"
            ),
            _ => tracing::info!(task_id = %task_id, status = %target, "Task finished"),
        }
        Ok(())
    }

    // ── Workers ─────────────────────────────────────────────────────────

    pub async fn register_worker(
        &self,
        worker_id: impl Into<String>,
        capacity: ResourceCapacity,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<(), ScheduleError> {
        self.register_worker_at(worker_id, capacity, capabilities, Utc::now())
            .await
    }

    pub async fn register_worker_at(
        &self,
        worker_id: impl Into<String>,
        capacity: ResourceCapacity,
        capabilities: impl IntoIterator<Item = String>,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let worker_id = worker_id.into();
        let mut state = self.state.lock().await;
        if state.workers.contains_key(&worker_id) {
            return Err(ScheduleError::WorkerExists { worker_id });
        }
        let record = WorkerRecord::new(worker_id.clone(), capacity, capabilities, now);
        tracing::info!(
            worker_id = %worker_id,
            cpu = capacity.cpu_cores,
            memory_mb = capacity.memory_mb,
            gpus = capacity.gpu_count,
            "Worker registered"
        );
        state.workers.insert(worker_id, record);
        Ok(())
    }

    /// Remove a worker gracefully. A task it held is requeued without
    /// counting against the task's requeue budget.
    pub async fn unregister_worker(
        &self,
        worker_id: &str,
    ) -> Result<LossOutcome, ScheduleError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let record = state
            .workers
            .remove(worker_id)
            .ok_or_else(|| ScheduleError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;

        let outcome = match record.current_task_id {
            Some(task_id) => state.recover_task(task_id, false, self.config.max_requeues, now),
            None => LossOutcome::Idle,
        };
        tracing::info!(worker_id = %worker_id, outcome = ?outcome, "Worker unregistered");
        Ok(outcome)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), ScheduleError> {
        self.heartbeat_at(worker_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ScheduleError> {
        let mut state = self.state.lock().await;
        let worker = state
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| ScheduleError::UnknownWorker {
                worker_id: worker_id.to_string(),
            })?;
        if now > worker.last_heartbeat {
            worker.last_heartbeat = now;
        }
        Ok(())
    }

    // ── Tick ────────────────────────────────────────────────────────────

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Aging, worker expiry, then auto-assignment, under one lock.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let mut state = self.state.lock().await;
        let promotions = self.promote_aged(&mut state, now);
        let lost_workers = self.expire_workers(&mut state, now);
        let round = self.assign_pending(&mut state, now);

        if !round.assigned.is_empty() || !promotions.is_empty() || !lost_workers.is_empty() {
            tracing::debug!(
                assigned = round.assigned.len(),
                unassigned = round.unassigned.len(),
                deferred = round.deferred.len(),
                promoted = promotions.len(),
                lost = lost_workers.len(),
                "Scheduler tick"
            );
        }

        TickReport {
            promotions,
            lost_workers,
            round,
        }
    }

    /// Promote queued entries waiting past the boost threshold.
    pub async fn promote_aged_at(&self, now: DateTime<Utc>) -> Vec<Promotion> {
        let mut state = self.state.lock().await;
        self.promote_aged(&mut state, now)
    }

    /// Unregister workers whose heartbeat is older than the worker timeout.
    pub async fn expire_workers_at(&self, now: DateTime<Utc>) -> Vec<WorkerLoss> {
        let mut state = self.state.lock().await;
        self.expire_workers(&mut state, now)
    }

    pub async fn assign_pending_at(&self, now: DateTime<Utc>) -> AssignmentRound {
        let mut state = self.state.lock().await;
        self.assign_pending(&mut state, now)
    }

    fn promote_aged(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Vec<Promotion> {
        let threshold = self.config.boost_threshold;
        let mut promotions = Vec::new();

        let SchedulerState {
            entries, queued, ..
        } = &mut *state;
        for task_id in queued.iter() {
            let Some(entry) = entries.get_mut(task_id) else {
                continue;
            };
            if entry.priority == TaskPriority::Critical {
                continue;
            }
            let waited = (now - entry.last_promoted_at).to_std().unwrap_or_default();
            if waited > threshold {
                let from = entry.priority;
                entry.priority = from.promoted();
                entry.last_promoted_at = now;
                tracing::debug!(task_id = %task_id, from = %from, to = %entry.priority, "Priority aged up");
                promotions.push(Promotion {
                    task_id: task_id.clone(),
                    from,
                    to: entry.priority,
                });
            }
        }

        let stale_keys = state.queue.raw_len().saturating_sub(state.queued.len());
        if !promotions.is_empty() || stale_keys > state.queued.len() {
            state.rebuild_queue();
        }
        promotions
    }

    fn expire_workers(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> Vec<WorkerLoss> {
        let timeout = self.config.worker_timeout;
        let expired: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.is_timed_out(now, timeout))
            .map(|w| w.worker_id.clone())
            .collect();

        let mut losses = Vec::with_capacity(expired.len());
        for worker_id in expired {
            let Some(record) = state.workers.remove(&worker_id) else {
                continue;
            };
            state.workers_lost += 1;

            let outcome = match record.current_task_id {
                Some(task_id) => state.recover_task(task_id, true, self.config.max_requeues, now),
                None => LossOutcome::Idle,
            };
            tracing::warn!(
                worker_id = %worker_id,
                last_heartbeat = %record.last_heartbeat,
                outcome = ?outcome,
                "Worker heartbeat timed out, unregistered"
            );
            losses.push(WorkerLoss {
                worker_id,
                last_heartbeat: record.last_heartbeat,
                outcome,
            });
        }
        losses
    }

    fn assign_pending(&self, state: &mut SchedulerState, now: DateTime<Utc>) -> AssignmentRound {
        let mut round = AssignmentRound::default();
        let mut free: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.available)
            .map(|w| w.worker_id.clone())
            .collect();

        let mut waiting: Vec<QueueKey> = Vec::new();

        while !free.is_empty() {
            let Some(key) = state.queue.pop() else {
                break;
            };
            if !state.is_live(&key) {
                continue;
            }
            let task_id = key.task_id.clone();
            let Some(entry) = state.entries.get(&task_id) else {
                continue;
            };

            match state.dependency_state(&entry.descriptor.dependencies) {
                DependencyState::Ready => {}
                DependencyState::Waiting => {
                    round.deferred.push(task_id);
                    continue;
                }
                DependencyState::Broken(dep) => {
                    state.queued.remove(&task_id);
                    if let Some(entry) = state.entries.get_mut(&task_id) {
                        let _ = entry.descriptor.transition_at(
                            TaskStatus::Failed,
                            Some(format!("dependency {dep} failed")),
                            now,
                        );
                    }
                    tracing::warn!(task_id = %task_id, dependency = %dep, "Dependency failed, task failed");
                    round.dependency_failures.push(task_id);
                    continue;
                }
            }

            let requirements = entry.descriptor.resource_requirements;
            let strategy = entry.descriptor.strategy;
            let best = free
                .iter()
                .filter_map(|id| {
                    let worker = state.workers.get(id)?;
                    fit_score(worker, &requirements, strategy).map(|score| (score, id))
                })
                .max_by(|a, b| a.0.total_cmp(&b.0).then_with(|| b.1.cmp(a.1)))
                .map(|(score, id)| (score, id.clone()));

            let Some((score, worker_id)) = best else {
                tracing::debug!(task_id = %task_id, "No eligible worker");
                round.unassigned.push(Unassigned {
                    task_id,
                    reason: UnassignedReason::NoEligibleWorker,
                });
                waiting.push(key);
                continue;
            };

            let Some(entry) = state.entries.get_mut(&task_id) else {
                continue;
            };
            if entry
                .descriptor
                .transition_at(TaskStatus::Assigned, Some(format!("assigned to {worker_id}")), now)
                .is_err()
            {
                waiting.push(key);
                continue;
            }
            entry.assigned_worker = Some(worker_id.clone());
            let priority = entry.priority;
            state.queued.remove(&task_id);
            if let Some(worker) = state.workers.get_mut(&worker_id) {
                worker.occupy(task_id.clone());
            }
            free.retain(|id| id != &worker_id);

            tracing::info!(
                task_id = %task_id,
                worker_id = %worker_id,
                priority = %priority,
                score,
                "Task assigned"
            );
            round.assigned.push(Assignment {
                task_id,
                worker_id,
                priority,
                score,
            });
        }

        for key in waiting {
            state.queue.push_key(key);
        }
        for task_id in &round.deferred {
            state.enqueue(task_id, true);
        }

        round
    }

    /// Drop finished entries older than the retention window. Entries a
    /// live task still depends on are kept for dependency gating.
    pub async fn prune_finished_at(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.entry_retention;
        let mut state = self.state.lock().await;

        let referenced: HashSet<TaskId> = state
            .entries
            .values()
            .filter(|e| !e.status().is_terminal())
            .flat_map(|e| e.descriptor.dependencies.iter().cloned())
            .collect();

        let before = state.entries.len();
        state.entries.retain(|task_id, entry| {
            // a cancelled task still held by a worker waits for its stop acknowledgement
            if !entry.status().is_terminal()
                || entry.assigned_worker.is_some()
                || referenced.contains(task_id)
            {
                return true;
            }
            let finished_at = entry.descriptor.completed_at.unwrap_or(entry.scheduled_at);
            (now - finished_at).to_std().unwrap_or_default() <= retention
        });
        let pruned = before - state.entries.len();
        if pruned > 0 {
            tracing::debug!(pruned, "Pruned finished schedule entries");
        }
        pruned
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub async fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.state
            .lock()
            .await
            .entries
            .get(task_id)
            .map(|e| e.status())
    }

    pub async fn entry(&self, task_id: &TaskId) -> Option<ScheduleEntry> {
        self.state.lock().await.entries.get(task_id).cloned()
    }

    pub async fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.state.lock().await.workers.get(worker_id).cloned()
    }

    pub async fn workers(&self) -> Vec<WorkerRecord> {
        self.state.lock().await.workers.values().cloned().collect()
    }

    /// Tasks held by a worker and not cancelled, with the holding worker.
    pub async fn active_assignments(&self) -> Vec<(TaskId, String)> {
        let state = self.state.lock().await;
        let mut held: Vec<(TaskId, String)> = state
            .entries
            .values()
            .filter(|e| e.status().is_assigned())
            .filter_map(|e| Some((e.task_id().clone(), e.assigned_worker.clone()?)))
            .collect();
        held.sort();
        held
    }

    /// Queued task ids in the order they would be considered for assignment.
    pub async fn queued_in_order(&self) -> Vec<TaskId> {
        let state = self.state.lock().await;
        state
            .queue
            .ordered_keys()
            .into_iter()
            .filter(|key| state.is_live(key))
            .map(|key| key.task_id)
            .collect()
    }

    /// Whether another task could be enqueued right now.
    pub async fn is_accepting(&self) -> bool {
        self.state.lock().await.queued.len() < self.config.max_queue_size
    }

    pub async fn stats(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        let mut stats = SchedulerStats {
            workers_total: state.workers.len(),
            workers_available: state.workers.values().filter(|w| w.available).count(),
            workers_lost: state.workers_lost,
            requeues: state.requeues,
            max_queue_size: self.config.max_queue_size,
            ..Default::default()
        };
        for entry in state.entries.values() {
            match entry.status() {
                TaskStatus::Pending => {}
                TaskStatus::Scheduled => {
                    stats.queued += 1;
                    *stats.queued_by_priority.entry(entry.priority).or_insert(0) += 1;
                }
                TaskStatus::Assigned => stats.assigned += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;
    use crate::task::{LearningStrategy, ResourceRequirements};

    fn descriptor(id: &str) -> TaskDescriptor {
        let mut d = TaskDescriptor::new(
            TaskId::from(id),
            "model",
            LearningStrategy::Incremental,
            Utc::now(),
        );
        d.resource_requirements = ResourceRequirements {
            cpu_cores: 1.0,
            memory_mb: 1024,
            gpu_count: 0,
        };
        d
    }

    fn small_worker() -> ResourceCapacity {
        ResourceCapacity::new(2.0, 4096, 0)
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            worker_timeout: Duration::from_secs(30),
            boost_threshold: Duration::from_secs(500),
            max_requeues: 1,
            ..SchedulerConfig::default()
        }
    }

    fn no_deps() -> Vec<TaskId> {
        Vec::new()
    }

    #[tokio::test]
    async fn schedule_rejects_duplicates_and_unknown_dependencies() {
        let scheduler = TaskScheduler::new(config());
        scheduler
            .schedule(descriptor("a"), TaskPriority::Normal, no_deps())
            .await
            .unwrap();

        let dup = scheduler
            .schedule(descriptor("a"), TaskPriority::Normal, no_deps())
            .await;
        assert!(matches!(dup, Err(ScheduleError::AlreadyScheduled { .. })));

        let unknown = scheduler
            .schedule(descriptor("b"), TaskPriority::Normal, vec![TaskId::from("zzz")])
            .await;
        assert!(matches!(unknown, Err(ScheduleError::UnknownDependency { .. })));

        let selfdep = scheduler
            .schedule(descriptor("c"), TaskPriority::Normal, vec![TaskId::from("c")])
            .await;
        assert!(matches!(selfdep, Err(ScheduleError::SelfDependency { .. })));
    }

    #[tokio::test]
    async fn queue_full_rejected() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            max_queue_size: 1,
            ..config()
        });
        scheduler
            .schedule(descriptor("a"), TaskPriority::Normal, no_deps())
            .await
            .unwrap();
        let full = scheduler
            .schedule(descriptor("b"), TaskPriority::Normal, no_deps())
            .await;
        assert_eq!(full, Err(ScheduleError::QueueFull { max: 1 }));
        assert!(!scheduler.is_accepting().await);
    }

    #[tokio::test]
    async fn aging_promotes_but_keeps_tier_order() {
        let scheduler = TaskScheduler::new(config());
        let t0 = Utc::now();
        scheduler
            .schedule_at(descriptor("b"), TaskPriority::Low, no_deps(), t0 - TimeDelta::seconds(1000))
            .await
            .unwrap();
        scheduler
            .schedule_at(descriptor("a"), TaskPriority::High, no_deps(), t0)
            .await
            .unwrap();

        let report = scheduler.tick_at(t0).await;
        assert_eq!(report.promotions.len(), 1);
        assert_eq!(report.promotions[0].to, TaskPriority::Normal);

        let b = scheduler.entry(&TaskId::from("b")).await.unwrap();
        assert_eq!(b.priority, TaskPriority::Normal);
        assert_eq!(b.original_priority, TaskPriority::Low);
        assert_eq!(
            scheduler.queued_in_order().await,
            vec![TaskId::from("a"), TaskId::from("b")]
        );

        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), t0)
            .await
            .unwrap();
        let round = scheduler.assign_pending_at(t0).await;
        assert_eq!(round.assigned[0].task_id, TaskId::from("a"));
    }

    #[tokio::test]
    async fn aging_is_one_tier_per_window() {
        let scheduler = TaskScheduler::new(config());
        let t0 = Utc::now();
        scheduler
            .schedule_at(descriptor("b"), TaskPriority::Low, no_deps(), t0)
            .await
            .unwrap();

        assert!(scheduler.promote_aged_at(t0 + TimeDelta::seconds(400)).await.is_empty());
        assert_eq!(scheduler.promote_aged_at(t0 + TimeDelta::seconds(501)).await.len(), 1);
        assert!(scheduler.promote_aged_at(t0 + TimeDelta::seconds(600)).await.is_empty());
        scheduler.promote_aged_at(t0 + TimeDelta::seconds(1002)).await;
        scheduler.promote_aged_at(t0 + TimeDelta::seconds(1503)).await;
        scheduler.promote_aged_at(t0 + TimeDelta::seconds(2004)).await;
        let b = scheduler.entry(&TaskId::from("b")).await.unwrap();
        assert_eq!(b.priority, TaskPriority::Critical);
    }

    #[tokio::test]
    async fn dependency_gating_does_not_block_head() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        scheduler
            .schedule_at(descriptor("parent"), TaskPriority::Low, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .schedule_at(
                descriptor("child"),
                TaskPriority::Critical,
                vec![TaskId::from("parent")],
                now,
            )
            .await
            .unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), now)
            .await
            .unwrap();

        let round = scheduler.assign_pending_at(now).await;
        assert_eq!(round.deferred, vec![TaskId::from("child")]);
        assert_eq!(round.assigned[0].task_id, TaskId::from("parent"));

        scheduler.complete_at(&TaskId::from("parent"), now).await.unwrap();
        let round = scheduler.assign_pending_at(now).await;
        assert_eq!(round.assigned[0].task_id, TaskId::from("child"));
    }

    #[tokio::test]
    async fn failed_dependency_fails_dependent() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        scheduler
            .schedule_at(descriptor("parent"), TaskPriority::Normal, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .schedule_at(descriptor("child"), TaskPriority::Normal, vec![TaskId::from("parent")], now)
            .await
            .unwrap();
        scheduler.cancel_at(&TaskId::from("parent"), now).await.unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), now)
            .await
            .unwrap();

        let round = scheduler.assign_pending_at(now).await;
        assert_eq!(round.dependency_failures, vec![TaskId::from("child")]);
        assert_eq!(
            scheduler.status(&TaskId::from("child")).await,
            Some(TaskStatus::Failed)
        );
    }

    #[tokio::test]
    async fn no_eligible_worker_keeps_task_queued() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        let mut big = descriptor("big");
        big.resource_requirements.gpu_count = 2;
        scheduler
            .schedule_at(big, TaskPriority::High, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .schedule_at(descriptor("small"), TaskPriority::Low, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), now)
            .await
            .unwrap();

        let round = scheduler.assign_pending_at(now).await;
        assert_eq!(round.unassigned.len(), 1);
        assert_eq!(round.unassigned[0].reason.to_string(), "no eligible worker");
        assert_eq!(round.assigned[0].task_id, TaskId::from("small"));
        assert_eq!(
            scheduler.status(&TaskId::from("big")).await,
            Some(TaskStatus::Scheduled)
        );
        assert_eq!(scheduler.queued_in_order().await, vec![TaskId::from("big")]);
    }

    #[tokio::test]
    async fn best_fit_prefers_exact_worker() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        scheduler
            .register_worker_at("huge", ResourceCapacity::new(64.0, 262_144, 8), Vec::new(), now)
            .await
            .unwrap();
        scheduler
            .register_worker_at("exact", ResourceCapacity::new(1.0, 1024, 0), Vec::new(), now)
            .await
            .unwrap();
        scheduler
            .schedule_at(descriptor("t"), TaskPriority::Normal, no_deps(), now)
            .await
            .unwrap();

        let round = scheduler.assign_pending_at(now).await;
        assert_eq!(round.assigned[0].worker_id, "exact");
        let worker = scheduler.worker("exact").await.unwrap();
        assert!(!worker.available);
        assert_eq!(worker.current_task_id, Some(TaskId::from("t")));
    }

    #[tokio::test]
    async fn worker_timeout_requeues_then_fails() {
        let scheduler = TaskScheduler::new(config());
        let t0 = Utc::now();
        let task = TaskId::from("t");
        scheduler
            .schedule_at(descriptor("t"), TaskPriority::Normal, no_deps(), t0)
            .await
            .unwrap();

        // first loss: requeued
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), t0)
            .await
            .unwrap();
        scheduler.assign_pending_at(t0).await;
        let t1 = t0 + TimeDelta::seconds(31);
        let losses = scheduler.expire_workers_at(t1).await;
        assert_eq!(
            losses[0].outcome,
            LossOutcome::Requeued {
                task_id: task.clone(),
                requeue_count: 1
            }
        );
        assert_eq!(scheduler.status(&task).await, Some(TaskStatus::Scheduled));
        assert!(scheduler.worker("w1").await.is_none());

        // second loss exceeds max_requeues = 1
        scheduler
            .register_worker_at("w2", small_worker(), Vec::new(), t1)
            .await
            .unwrap();
        scheduler.assign_pending_at(t1).await;
        let losses = scheduler.expire_workers_at(t1 + TimeDelta::seconds(31)).await;
        assert_eq!(losses[0].outcome, LossOutcome::Failed { task_id: task.clone() });
        let entry = scheduler.entry(&task).await.unwrap();
        assert_eq!(entry.status(), TaskStatus::Failed);
        assert_eq!(entry.descriptor.failure_reason.as_deref(), Some(REPEATED_WORKER_LOSS));
    }

    #[tokio::test]
    async fn heartbeat_keeps_worker_alive() {
        let scheduler = TaskScheduler::new(config());
        let t0 = Utc::now();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), t0)
            .await
            .unwrap();
        scheduler
            .heartbeat_at("w1", t0 + TimeDelta::seconds(20))
            .await
            .unwrap();
        assert!(scheduler.expire_workers_at(t0 + TimeDelta::seconds(40)).await.is_empty());
        assert!(matches!(
            scheduler.heartbeat("ghost").await,
            Err(ScheduleError::UnknownWorker { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let scheduler = TaskScheduler::new(config());
        let id = TaskId::from("t");
        scheduler
            .schedule(descriptor("t"), TaskPriority::Normal, no_deps())
            .await
            .unwrap();
        assert_eq!(scheduler.cancel(&id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(
            scheduler.cancel(&id).await.unwrap(),
            CancelOutcome::AlreadyCancelled
        );
        assert_eq!(scheduler.status(&id).await, Some(TaskStatus::Cancelled));
        assert!(scheduler.queued_in_order().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_assigned_waits_for_acknowledgement() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        let id = TaskId::from("t");
        scheduler
            .schedule_at(descriptor("t"), TaskPriority::Normal, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), now)
            .await
            .unwrap();
        scheduler.assign_pending_at(now).await;

        let outcome = scheduler.cancel_at(&id, now).await.unwrap();
        assert_eq!(
            outcome,
            CancelOutcome::StopRequested {
                worker_id: "w1".into()
            }
        );
        assert!(!scheduler.worker("w1").await.unwrap().available);

        scheduler.acknowledge_stop(&id).await.unwrap();
        let worker = scheduler.worker("w1").await.unwrap();
        assert!(worker.available);
        assert!(worker.current_task_id.is_none());
        assert_eq!(scheduler.status(&id).await, Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn complete_requires_assignment() {
        let scheduler = TaskScheduler::new(config());
        let id = TaskId::from("t");
        scheduler
            .schedule(descriptor("t"), TaskPriority::Normal, no_deps())
            .await
            .unwrap();
        assert!(matches!(
            scheduler.complete(&id).await,
            Err(ScheduleError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.complete(&TaskId::from("nope")).await,
            Err(ScheduleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn graceful_unregister_requeues_without_penalty() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        let id = TaskId::from("t");
        scheduler
            .schedule_at(descriptor("t"), TaskPriority::Normal, no_deps(), now)
            .await
            .unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), now)
            .await
            .unwrap();
        scheduler.assign_pending_at(now).await;
        scheduler.mark_running_at(&id, now).await.unwrap();

        let outcome = scheduler.unregister_worker("w1").await.unwrap();
        assert_eq!(
            outcome,
            LossOutcome::Requeued {
                task_id: id.clone(),
                requeue_count: 0
            }
        );
        let stats = scheduler.stats().await;
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.workers_total, 0);
    }

    #[tokio::test]
    async fn finished_entries_pruned_after_retention() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            entry_retention: Duration::from_secs(60),
            ..config()
        });
        let t0 = Utc::now();
        for i in 0..5 {
            let id = format!("c{i}");
            scheduler
                .schedule_at(descriptor(&id), TaskPriority::Normal, no_deps(), t0)
                .await
                .unwrap();
            scheduler.cancel_at(&TaskId::from(id), t0).await.unwrap();
        }
        scheduler
            .schedule_at(descriptor("live"), TaskPriority::Normal, no_deps(), t0)
            .await
            .unwrap();

        assert_eq!(scheduler.prune_finished_at(t0 + TimeDelta::seconds(30)).await, 0);
        assert_eq!(scheduler.prune_finished_at(t0 + TimeDelta::seconds(61)).await, 5);
        let stats = scheduler.stats().await;
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.queued, 1);
        assert!(scheduler.status(&TaskId::from("c0")).await.is_none());
    }

    #[tokio::test]
    async fn pruning_keeps_entries_live_tasks_depend_on() {
        let scheduler = TaskScheduler::new(SchedulerConfig {
            entry_retention: Duration::from_secs(60),
            ..config()
        });
        let t0 = Utc::now();
        scheduler
            .schedule_at(descriptor("parent"), TaskPriority::Normal, no_deps(), t0)
            .await
            .unwrap();
        scheduler
            .register_worker_at("w1", small_worker(), Vec::new(), t0)
            .await
            .unwrap();
        scheduler.assign_pending_at(t0).await;
        scheduler.complete_at(&TaskId::from("parent"), t0).await.unwrap();
        scheduler
            .schedule_at(descriptor("child"), TaskPriority::Normal, vec![TaskId::from("parent")], t0)
            .await
            .unwrap();

        assert_eq!(scheduler.prune_finished_at(t0 + TimeDelta::seconds(120)).await, 0);
        assert_eq!(
            scheduler.status(&TaskId::from("parent")).await,
            Some(TaskStatus::Completed)
        );

        scheduler.heartbeat_at("w1", t0 + TimeDelta::seconds(120)).await.unwrap();
        let round = scheduler.assign_pending_at(t0 + TimeDelta::seconds(120)).await;
        assert_eq!(round.assigned[0].task_id, TaskId::from("child"));
    }

    #[tokio::test]
    async fn active_assignments_skip_cancelled() {
        let scheduler = TaskScheduler::new(config());
        let now = Utc::now();
        for id in ["a", "b"] {
            scheduler
                .schedule_at(descriptor(id), TaskPriority::Normal, no_deps(), now)
                .await
                .unwrap();
        }
        for w in ["w1", "w2"] {
            scheduler
                .register_worker_at(w, small_worker(), Vec::new(), now)
                .await
                .unwrap();
        }
        scheduler.assign_pending_at(now).await;
        scheduler.cancel_at(&TaskId::from("b"), now).await.unwrap();

        assert_eq!(
            scheduler.active_assignments().await,
            vec![(TaskId::from("a"), "w1".to_string())]
        );
    }
}
