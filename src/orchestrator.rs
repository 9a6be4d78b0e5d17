//! Orchestrator: the public face that wires creation, scheduling, tracking,
//! replay buffers and persistence together.
//!
//! Lifecycle calls fan out to both the scheduler and the tracker. The
//! scheduler is the authority on task status; the tracker is a progress view
//! that `health_check` reconciles against it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};

use crate::config::OrchestratorConfig;
use crate::error::{Error, ScheduleError, TrackingError};
use crate::memory::MemoryBuffer;
use crate::scheduler::{
    CancelOutcome, LossOutcome, REPEATED_WORKER_LOSS, ResourceCapacity, TaskPriority,
    TaskScheduler, TickReport, WorkerLoss,
};
use crate::store::TaskStore;
use crate::task::{CreatedTask, LearningStrategy, TaskCreator, TaskId, TaskRequest, TaskStatus};
use crate::tracking::{ExecutionContext, ProgressTracker, StaleTask};

/// Shared handle to a task's replay buffer.
pub type SharedBuffer = Arc<Mutex<MemoryBuffer>>;

/// Result of a progress report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressAck {
    /// Stored progress after clamping.
    pub progress: f64,
    /// The task was cancelled; the executor should stop and acknowledge.
    pub stop_requested: bool,
}

/// Result of a complete/fail/cancel fan-out. Both components are always
/// attempted; the call succeeds if either did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub cancel: Option<CancelOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracker_error: Option<String>,
}

impl LifecycleOutcome {
    fn new(
        task_id: &TaskId,
        scheduler: Result<Option<CancelOutcome>, ScheduleError>,
        tracker: Result<(), TrackingError>,
    ) -> Self {
        let (cancel, scheduler_error) = match scheduler {
            Ok(cancel) => (cancel, None),
            Err(e) => (None, Some(e.to_string())),
        };
        let tracker_error = tracker.err().map(|e| e.to_string());
        Self {
            task_id: task_id.clone(),
            success: scheduler_error.is_none() || tracker_error.is_none(),
            cancel,
            scheduler_error,
            tracker_error,
        }
    }
}

/// Outcome of one stale-monitor pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorReport {
    pub stale: Vec<StaleTask>,
    pub lost_workers: Vec<WorkerLoss>,
    /// Archived contexts dropped by retention.
    pub pruned: usize,
    /// Finished scheduler entries dropped by retention.
    pub pruned_entries: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: &'static str,
    pub status: HealthStatus,
    pub details: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub components: Vec<ComponentHealth>,
    /// Tracker contexts repaired to match the scheduler during this check.
    pub repaired: usize,
    pub checked_at: DateTime<Utc>,
}

pub struct Orchestrator {
    creator: TaskCreator,
    scheduler: Arc<TaskScheduler>,
    tracker: Arc<ProgressTracker>,
    store: Option<Arc<dyn TaskStore>>,
    buffers: RwLock<HashMap<TaskId, SharedBuffer>>,
    /// Worker losses since the last health check.
    recent_losses: AtomicU64,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            creator: TaskCreator::new(config.creator),
            scheduler: Arc::new(TaskScheduler::new(config.scheduler)),
            tracker: Arc::new(ProgressTracker::new(config.tracker)),
            store: None,
            buffers: RwLock::new(HashMap::new()),
            recent_losses: AtomicU64::new(0),
        }
    }

    /// Persist descriptors and finished contexts through `store`.
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    // ── Creation ────────────────────────────────────────────────────

    pub async fn create_task(
        &self,
        target_id: &str,
        strategy: LearningStrategy,
        config: Map<String, Value>,
        priority: TaskPriority,
    ) -> Result<CreatedTask, Error> {
        self.create_task_at(target_id, strategy, config, priority, Utc::now())
            .await
    }

    /// Validate, start tracking, then enqueue. Tracking is rolled back if
    /// the scheduler refuses the task.
    pub async fn create_task_at(
        &self,
        target_id: &str,
        strategy: LearningStrategy,
        config: Map<String, Value>,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, Error> {
        let created = self.creator.create_at(target_id, strategy, config, now)?;
        self.admit(created, priority, now).await
    }

    /// Create from a raw request whose fields may be missing.
    pub async fn submit(
        &self,
        request: TaskRequest,
        priority: TaskPriority,
    ) -> Result<CreatedTask, Error> {
        let now = Utc::now();
        let created = self.creator.create_from_request_at(request, now)?;
        self.admit(created, priority, now).await
    }

    async fn admit(
        &self,
        mut created: CreatedTask,
        priority: TaskPriority,
        now: DateTime<Utc>,
    ) -> Result<CreatedTask, Error> {
        let task_id = created.descriptor.task_id.clone();

        let buffer = match created.replay {
            Some(spec) => Some(MemoryBuffer::new(spec.capacity, spec.policy)?),
            None => None,
        };

        self.tracker
            .start_task_tracking_at(task_id.clone(), None, now)
            .await?;

        if let Err(e) = self
            .scheduler
            .schedule_at(created.descriptor.clone(), priority, Vec::new(), now)
            .await
        {
            self.tracker.discard(&task_id).await;
            tracing::warn!(task_id = %task_id, error = %e, "Scheduling refused, tracking rolled back");
            return Err(e.into());
        }

        if let Some(entry) = self.scheduler.entry(&task_id).await {
            created.descriptor = entry.descriptor;
        }
        if let Some(buffer) = buffer {
            self.buffers
                .write()
                .await
                .insert(task_id.clone(), Arc::new(Mutex::new(buffer)));
        }

        for warning in &created.warnings {
            tracing::info!(task_id = %task_id, field = %warning.field, "{}", warning.message);
        }
        tracing::info!(
            task_id = %task_id,
            target_id = %created.descriptor.target_id,
            strategy = %created.descriptor.strategy.as_str(),
            priority = %priority,
            "Task created"
        );

        if let Some(store) = &self.store {
            if let Err(e) = store.put_task(&created.descriptor).await {
                tracing::warn!(task_id = %task_id, error = %e, "Failed to persist task");
            }
        }
        Ok(created)
    }

    // ── Workers ─────────────────────────────────────────────────────

    pub async fn register_worker(
        &self,
        worker_id: impl Into<String>,
        capacity: ResourceCapacity,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Result<(), Error> {
        Ok(self
            .scheduler
            .register_worker(worker_id, capacity, capabilities)
            .await?)
    }

    pub async fn worker_heartbeat(&self, worker_id: &str) -> Result<(), Error> {
        Ok(self.scheduler.heartbeat(worker_id).await?)
    }

    /// Remove a worker on request. Its task, if any, is requeued.
    pub async fn unregister_worker(&self, worker_id: &str) -> Result<LossOutcome, Error> {
        let outcome = self.scheduler.unregister_worker(worker_id).await?;
        self.apply_loss_outcome(&outcome, Utc::now()).await;
        Ok(outcome)
    }

    // ── Execution callbacks ─────────────────────────────────────────

    pub async fn report_progress(
        &self,
        task_id: &TaskId,
        percent: f64,
        phase: impl Into<String>,
        details: Option<Value>,
    ) -> Result<ProgressAck, Error> {
        self.report_progress_at(task_id, percent, phase, details, Utc::now())
            .await
    }

    pub async fn report_progress_at(
        &self,
        task_id: &TaskId,
        percent: f64,
        phase: impl Into<String>,
        details: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<ProgressAck, Error> {
        let entry = self
            .scheduler
            .entry(task_id)
            .await
            .ok_or_else(|| ScheduleError::NotFound { id: task_id.clone() })?;
        let status = entry.status();
        if !status.is_assigned() && !entry.cancel_requested {
            return Err(ScheduleError::InvalidTransition {
                id: task_id.clone(),
                state: status.to_string(),
                target: TaskStatus::Running.to_string(),
            }
            .into());
        }
        if status.is_assigned() {
            if let Some(worker_id) = &entry.assigned_worker {
                self.retrack(task_id, worker_id, now).await;
            }
        }

        let progress = match self
            .tracker
            .update_progress_at(task_id, percent, phase, details, now)
            .await
        {
            Ok(progress) => progress,
            // a cancelled task's context is archived already
            Err(TrackingError::NotFound { .. }) if entry.cancel_requested => 0.0,
            Err(e) => return Err(e.into()),
        };
        let stop_requested = self.scheduler.record_progress_at(task_id, now).await?;
        Ok(ProgressAck {
            progress,
            stop_requested,
        })
    }

    pub async fn complete_task(&self, task_id: &TaskId) -> LifecycleOutcome {
        let now = Utc::now();
        let scheduler = self.scheduler.complete_at(task_id, now).await.map(|_| None);
        let tracker = self.tracker.complete_task_tracking_at(task_id, now).await;
        self.finish(task_id, scheduler, tracker).await
    }

    pub async fn fail_task(&self, task_id: &TaskId, reason: impl Into<String>) -> LifecycleOutcome {
        let now = Utc::now();
        let reason = reason.into();
        let scheduler = self
            .scheduler
            .fail_at(task_id, reason.clone(), now)
            .await
            .map(|_| None);
        let tracker = self.tracker.fail_task_tracking_at(task_id, reason, now).await;
        self.finish(task_id, scheduler, tracker).await
    }

    /// Cancel a task. Calling it again returns success with no change.
    pub async fn cancel_task(&self, task_id: &TaskId) -> LifecycleOutcome {
        let now = Utc::now();
        let scheduler = self.scheduler.cancel_at(task_id, now).await.map(Some);
        let tracker = self.tracker.cancel_task_tracking_at(task_id, now).await;
        self.finish(task_id, scheduler, tracker).await
    }

    /// The executor stopped a cancelled task.
    pub async fn acknowledge_stop(&self, task_id: &TaskId) -> Result<(), Error> {
        Ok(self.scheduler.acknowledge_stop(task_id).await?)
    }

    async fn finish(
        &self,
        task_id: &TaskId,
        scheduler: Result<Option<CancelOutcome>, ScheduleError>,
        tracker: Result<(), TrackingError>,
    ) -> LifecycleOutcome {
        let tracker_archived = tracker.is_ok();
        let outcome = LifecycleOutcome::new(task_id, scheduler, tracker);
        if !outcome.success {
            tracing::warn!(
                task_id = %task_id,
                scheduler_error = outcome.scheduler_error.as_deref().unwrap_or(""),
                tracker_error = outcome.tracker_error.as_deref().unwrap_or(""),
                "Lifecycle call failed"
            );
            return outcome;
        }

        self.buffers.write().await.remove(task_id);
        if tracker_archived {
            self.persist_context(task_id).await;
        }
        outcome
    }

    async fn persist_context(&self, task_id: &TaskId) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(context) = self.tracker.get_context(task_id).await else {
            return;
        };
        if let Err(e) = store.put_context(&context).await {
            tracing::warn!(task_id = %task_id, error = %e, "Failed to persist execution context");
        }
    }

    // ── Periodic work ───────────────────────────────────────────────

    pub async fn scheduling_tick(&self) -> TickReport {
        self.scheduling_tick_at(Utc::now()).await
    }

    /// One scheduler pass; assignments bind workers in the tracker.
    pub async fn scheduling_tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let report = self.scheduler.tick_at(now).await;

        for assignment in &report.round.assigned {
            if let Err(e) = self
                .tracker
                .bind_worker_at(&assignment.task_id, &assignment.worker_id, now)
                .await
            {
                tracing::warn!(task_id = %assignment.task_id, error = %e, "Assigned task has no tracking context");
                self.retrack(&assignment.task_id, &assignment.worker_id, now)
                    .await;
            }
        }
        for task_id in &report.round.dependency_failures {
            if let Err(e) = self
                .tracker
                .fail_task_tracking_at(task_id, "dependency failed", now)
                .await
            {
                tracing::debug!(task_id = %task_id, error = %e, "No context to fail for dependency failure");
            }
            self.buffers.write().await.remove(task_id);
            self.persist_context(task_id).await;
        }
        self.apply_worker_losses(&report.lost_workers, now).await;

        report
    }

    pub async fn monitor_tick(&self) -> MonitorReport {
        self.monitor_tick_at(Utc::now()).await
    }

    /// Stale detection and worker expiry, then retention pruning of
    /// archived contexts and finished scheduler entries.
    pub async fn monitor_tick_at(&self, now: DateTime<Utc>) -> MonitorReport {
        let stale = self.tracker.detect_stale_at(now).await;
        let lost_workers = self.scheduler.expire_workers_at(now).await;
        self.apply_worker_losses(&lost_workers, now).await;
        let pruned = self.tracker.prune_archive_at(now).await;
        let pruned_entries = self.scheduler.prune_finished_at(now).await;

        if !stale.is_empty() || !lost_workers.is_empty() {
            tracing::debug!(
                stale = stale.len(),
                lost = lost_workers.len(),
                pruned,
                pruned_entries,
                "Monitor tick"
            );
        }
        MonitorReport {
            stale,
            lost_workers,
            pruned,
            pruned_entries,
        }
    }

    async fn apply_worker_losses(&self, losses: &[WorkerLoss], now: DateTime<Utc>) {
        if losses.is_empty() {
            return;
        }
        self.recent_losses
            .fetch_add(losses.len() as u64, Ordering::Relaxed);
        for loss in losses {
            self.apply_loss_outcome(&loss.outcome, now).await;
        }
    }

    async fn apply_loss_outcome(&self, outcome: &LossOutcome, now: DateTime<Utc>) {
        match outcome {
            LossOutcome::Requeued { task_id, .. } => {
                if let Err(e) = self.tracker.reset_for_requeue_at(task_id, now).await {
                    tracing::warn!(task_id = %task_id, error = %e, "Requeued task has no tracking context");
                }
            }
            LossOutcome::Failed { task_id } => {
                if let Err(e) = self
                    .tracker
                    .fail_task_tracking_at(task_id, REPEATED_WORKER_LOSS, now)
                    .await
                {
                    tracing::debug!(task_id = %task_id, error = %e, "No context to fail after worker loss");
                }
                self.buffers.write().await.remove(task_id);
                self.persist_context(task_id).await;
            }
            LossOutcome::Idle | LossOutcome::StopReleased { .. } => {}
        }
    }

    // ── Health ──────────────────────────────────────────────────────

    pub async fn health_check(&self) -> HealthReport {
        self.health_check_at(Utc::now()).await
    }

    /// Reconcile the tracker with the scheduler, then grade each component.
    pub async fn health_check_at(&self, now: DateTime<Utc>) -> HealthReport {
        let repaired = self.reconcile(now).await;
        let losses = self.recent_losses.swap(0, Ordering::Relaxed);
        let sched = self.scheduler.stats().await;
        let tracking = self.tracker.stats().await;

        let mut scheduler = ComponentHealth {
            name: "scheduler",
            status: HealthStatus::Healthy,
            details: Vec::new(),
        };
        if sched.queued >= sched.max_queue_size {
            scheduler.status = HealthStatus::Unhealthy;
            scheduler
                .details
                .push(format!("queue full ({} entries)", sched.queued));
        }
        if sched.workers_total == 0 {
            scheduler.status = scheduler.status.max(HealthStatus::Degraded);
            scheduler.details.push("no workers registered".to_string());
        }
        if losses > 0 {
            scheduler.status = scheduler.status.max(HealthStatus::Degraded);
            scheduler
                .details
                .push(format!("{losses} worker(s) lost since last check"));
        }

        let mut tracker = ComponentHealth {
            name: "tracker",
            status: HealthStatus::Healthy,
            details: Vec::new(),
        };
        if tracking.active >= tracking.max_active_contexts {
            tracker.status = HealthStatus::Unhealthy;
            tracker
                .details
                .push(format!("context limit reached ({})", tracking.active));
        }
        if tracking.stale > 0 {
            tracker.status = tracker.status.max(HealthStatus::Degraded);
            tracker
                .details
                .push(format!("{} stale task(s)", tracking.stale));
        }
        if repaired > 0 {
            tracker.status = tracker.status.max(HealthStatus::Degraded);
            tracker
                .details
                .push(format!("{repaired} context(s) reconciled"));
        }

        let buffers = self.buffer_health().await;

        let status = scheduler.status.max(tracker.status).max(buffers.status);
        if status != HealthStatus::Healthy {
            tracing::warn!(status = ?status, "Health check not nominal");
        }
        HealthReport {
            status,
            components: vec![scheduler, tracker, buffers],
            repaired,
            checked_at: now,
        }
    }

    /// Check every replay buffer's size invariant. Buffers locked by a
    /// caller are skipped until the next check.
    async fn buffer_health(&self) -> ComponentHealth {
        let mut health = ComponentHealth {
            name: "buffers",
            status: HealthStatus::Healthy,
            details: Vec::new(),
        };
        for (task_id, buffer) in self.buffers.read().await.iter() {
            let Ok(buffer) = buffer.try_lock() else {
                continue;
            };
            if let Err(e) = buffer.check_integrity() {
                tracing::error!(task_id = %task_id, error = %e, "Replay buffer failed integrity check");
                health.status = HealthStatus::Unhealthy;
                health.details.push(format!("{task_id}: {e}"));
            }
        }
        health
    }

    /// Archive tracker contexts whose task already finished in the
    /// scheduler, drop contexts the scheduler has never heard of, and
    /// re-track assigned tasks that lost their context.
    async fn reconcile(&self, now: DateTime<Utc>) -> usize {
        let mut repaired = 0;
        for task_id in self.tracker.active_ids().await {
            let Some(entry) = self.scheduler.entry(&task_id).await else {
                if self.tracker.discard(&task_id).await {
                    tracing::warn!(task_id = %task_id, "Dropped context with no scheduler entry");
                    repaired += 1;
                }
                continue;
            };
            let status = entry.status();
            let result = match status {
                TaskStatus::Completed => self.tracker.complete_task_tracking_at(&task_id, now).await,
                TaskStatus::Failed => {
                    let reason = entry
                        .descriptor
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "failed".to_string());
                    self.tracker.fail_task_tracking_at(&task_id, reason, now).await
                }
                TaskStatus::Cancelled => self.tracker.cancel_task_tracking_at(&task_id, now).await,
                _ => continue,
            };
            if result.is_ok() {
                tracing::info!(task_id = %task_id, status = %status, "Reconciled tracking with scheduler");
                repaired += 1;
            }
        }

        for (task_id, worker_id) in self.scheduler.active_assignments().await {
            if self.retrack(&task_id, &worker_id, now).await {
                repaired += 1;
            }
        }
        repaired
    }

    /// Start a fresh context for an assigned task that has none. Returns
    /// whether a context was created.
    async fn retrack(&self, task_id: &TaskId, worker_id: &str, now: DateTime<Utc>) -> bool {
        if self.tracker.is_active(task_id).await {
            return false;
        }
        match self
            .tracker
            .start_task_tracking_at(task_id.clone(), Some(worker_id.to_string()), now)
            .await
        {
            Ok(()) => {
                tracing::warn!(task_id = %task_id, worker_id = %worker_id, "Re-tracked assigned task");
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %task_id, error = %e, "Could not re-track assigned task");
                false
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub async fn task_status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.scheduler.status(task_id).await
    }

    pub async fn progress(&self, task_id: &TaskId) -> Option<ExecutionContext> {
        self.tracker.get_context(task_id).await
    }

    /// Replay buffer attached to a live task.
    pub async fn buffer(&self, task_id: &TaskId) -> Option<SharedBuffer> {
        self.buffers.read().await.get(task_id).cloned()
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

/// Run `scheduling_tick` every `interval`.
pub fn spawn_scheduler_loop(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            orchestrator.scheduling_tick().await;
        }
    })
}

/// Run `monitor_tick` every `interval`.
pub fn spawn_monitor_loop(
    orchestrator: Arc<Orchestrator>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            orchestrator.monitor_tick().await;
        }
    })
}
