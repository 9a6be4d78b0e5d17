//! Progress tracker: active execution contexts plus a bounded archive.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::TrackerConfig;
use crate::error::TrackingError;
use crate::task::TaskId;
use crate::tracking::context::{
    ArchivedContext, ExecutionContext, PHASE_CANCELLED, PHASE_COMPLETED, PHASE_FAILED,
    PHASE_REQUEUED, ResourceUsage, StatusUpdate, TrackingOutcome,
};

/// A context flagged by the stale monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleTask {
    pub task_id: TaskId,
    pub worker_id: String,
    pub last_heartbeat: DateTime<Utc>,
    pub silent_for_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackerStats {
    pub active: usize,
    pub stale: usize,
    pub archived: usize,
    pub max_active_contexts: usize,
    pub average_progress: f64,
}

#[derive(Debug, Default)]
struct TrackerState {
    active: HashMap<TaskId, ExecutionContext>,
    archive: VecDeque<ArchivedContext>,
}

/// Tracks progress of executing tasks.
pub struct ProgressTracker {
    config: TrackerConfig,
    state: RwLock<TrackerState>,
}

impl ProgressTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub async fn start_task_tracking(
        &self,
        task_id: TaskId,
        worker_id: Option<String>,
    ) -> Result<(), TrackingError> {
        self.start_task_tracking_at(task_id, worker_id, Utc::now())
            .await
    }

    /// Create a context with progress 0 in phase "initializing".
    pub async fn start_task_tracking_at(
        &self,
        task_id: TaskId,
        worker_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state.write().await;
        if state.active.contains_key(&task_id) {
            return Err(TrackingError::AlreadyTracked { id: task_id });
        }
        if state.active.len() >= self.config.max_active_contexts {
            return Err(TrackingError::CapacityExceeded {
                max: self.config.max_active_contexts,
            });
        }
        tracing::debug!(task_id = %task_id, "Tracking started");
        let context = ExecutionContext::new(task_id.clone(), worker_id, now);
        state.active.insert(task_id, context);
        Ok(())
    }

    /// Attach the worker an assignment picked. Resets the heartbeat clock.
    pub async fn bind_worker_at(
        &self,
        task_id: &TaskId,
        worker_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state.write().await;
        let ctx = active_mut(&mut state, task_id)?;
        ctx.worker_id = Some(worker_id.into());
        ctx.last_heartbeat = now;
        ctx.stale = false;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        task_id: &TaskId,
        percent: f64,
        phase: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Result<f64, TrackingError> {
        self.update_progress_at(task_id, percent, phase, details, Utc::now())
            .await
    }

    /// Record a progress report and return the stored (clamped) percentage.
    pub async fn update_progress_at(
        &self,
        task_id: &TaskId,
        percent: f64,
        phase: impl Into<String>,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<f64, TrackingError> {
        let mut state = self.state.write().await;
        let ctx = active_mut(&mut state, task_id)?;
        ctx.apply_update(percent, phase, details, self.config.max_status_updates, now);
        Ok(ctx.progress_percent)
    }

    pub async fn record_resource_usage(
        &self,
        task_id: &TaskId,
        usage: ResourceUsage,
    ) -> Result<(), TrackingError> {
        let mut state = self.state.write().await;
        active_mut(&mut state, task_id)?.resource_usage = usage;
        Ok(())
    }

    /// Flag contexts whose bound worker has been silent past the stale
    /// threshold. Nothing is terminated; the returned list is advisory.
    pub async fn detect_stale_at(&self, now: DateTime<Utc>) -> Vec<StaleTask> {
        let threshold = self.config.stale_threshold;
        let mut state = self.state.write().await;
        let mut stale = Vec::new();

        for ctx in state.active.values_mut() {
            let Some(worker_id) = ctx.worker_id.clone() else {
                continue;
            };
            let silent = ctx.since_heartbeat(now);
            if silent <= threshold {
                continue;
            }
            if !ctx.stale {
                tracing::warn!(
                    task_id = %ctx.task_id,
                    worker_id = %worker_id,
                    silent_secs = silent.as_secs(),
                    "Task has gone stale"
                );
            }
            ctx.stale = true;
            stale.push(StaleTask {
                task_id: ctx.task_id.clone(),
                worker_id,
                last_heartbeat: ctx.last_heartbeat,
                silent_for_secs: silent.as_secs(),
            });
        }
        stale.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        stale
    }

    pub async fn complete_task_tracking(&self, task_id: &TaskId) -> Result<(), TrackingError> {
        self.complete_task_tracking_at(task_id, Utc::now()).await
    }

    /// Set progress to 100 and archive the context.
    pub async fn complete_task_tracking_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        self.archive(task_id, TrackingOutcome::Completed, now).await
    }

    pub async fn fail_task_tracking(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<(), TrackingError> {
        self.fail_task_tracking_at(task_id, reason, Utc::now()).await
    }

    pub async fn fail_task_tracking_at(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let reason = reason.into();
        self.archive(task_id, TrackingOutcome::Failed { reason }, now)
            .await
    }

    pub async fn cancel_task_tracking(&self, task_id: &TaskId) -> Result<(), TrackingError> {
        self.cancel_task_tracking_at(task_id, Utc::now()).await
    }

    pub async fn cancel_task_tracking_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        self.archive(task_id, TrackingOutcome::Cancelled, now).await
    }

    async fn archive(
        &self,
        task_id: &TaskId,
        outcome: TrackingOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state.write().await;
        let mut ctx = state
            .active
            .remove(task_id)
            .ok_or_else(|| TrackingError::NotFound { id: task_id.clone() })?;

        let (phase, progress) = match &outcome {
            TrackingOutcome::Completed => (PHASE_COMPLETED, 100.0),
            TrackingOutcome::Failed { reason } => {
                ctx.error = Some(reason.clone());
                (PHASE_FAILED, ctx.progress_percent)
            }
            TrackingOutcome::Cancelled => (PHASE_CANCELLED, ctx.progress_percent),
        };
        ctx.progress_percent = progress;
        ctx.current_phase = phase.to_string();
        ctx.stale = false;
        ctx.push_update(
            StatusUpdate {
                timestamp: now,
                progress,
                phase: phase.to_string(),
                details: None,
            },
            self.config.max_status_updates,
        );

        tracing::debug!(task_id = %task_id, phase, "Tracking archived");
        state.archive.push_back(ArchivedContext {
            context: ctx,
            outcome,
            archived_at: now,
        });
        while state.archive.len() > self.config.max_archived {
            state.archive.pop_front();
        }
        Ok(())
    }

    /// Drop a context without archiving it. Used to roll back a creation
    /// whose scheduling failed.
    pub async fn discard(&self, task_id: &TaskId) -> bool {
        self.state.write().await.active.remove(task_id).is_some()
    }

    /// The task went back to the queue: unbind the worker and start over.
    pub async fn reset_for_requeue_at(
        &self,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<(), TrackingError> {
        let mut state = self.state.write().await;
        let ctx = active_mut(&mut state, task_id)?;
        ctx.worker_id = None;
        ctx.stale = false;
        ctx.resource_usage = ResourceUsage::default();
        ctx.apply_update(0.0, PHASE_REQUEUED, None, self.config.max_status_updates, now);
        Ok(())
    }

    /// Remove archived contexts older than the retention window.
    pub async fn prune_archive_at(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.archive_retention;
        let mut state = self.state.write().await;
        let before = state.archive.len();
        state
            .archive
            .retain(|a| (now - a.archived_at).to_std().unwrap_or_default() <= retention);
        before - state.archive.len()
    }

    /// Active context first, then the archive.
    pub async fn get_context(&self, task_id: &TaskId) -> Option<ExecutionContext> {
        let state = self.state.read().await;
        state.active.get(task_id).cloned().or_else(|| {
            state
                .archive
                .iter()
                .rev()
                .find(|a| &a.context.task_id == task_id)
                .map(|a| a.context.clone())
        })
    }

    pub async fn get_archived(&self, task_id: &TaskId) -> Option<ArchivedContext> {
        let state = self.state.read().await;
        state
            .archive
            .iter()
            .rev()
            .find(|a| &a.context.task_id == task_id)
            .cloned()
    }

    pub async fn is_active(&self, task_id: &TaskId) -> bool {
        self.state.read().await.active.contains_key(task_id)
    }

    pub async fn active_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.state.read().await.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Whether another context can be started.
    pub async fn has_capacity(&self) -> bool {
        self.state.read().await.active.len() < self.config.max_active_contexts
    }

    pub async fn stats(&self) -> TrackerStats {
        let state = self.state.read().await;
        let active = state.active.len();
        let average_progress = if active == 0 {
            0.0
        } else {
            state
                .active
                .values()
                .map(|c| c.progress_percent)
                .sum::<f64>()
                / active as f64
        };
        TrackerStats {
            active,
            stale: state.active.values().filter(|c| c.stale).count(),
            archived: state.archive.len(),
            max_active_contexts: self.config.max_active_contexts,
            average_progress,
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

fn active_mut<'a>(
    state: &'a mut TrackerState,
    task_id: &TaskId,
) -> Result<&'a mut ExecutionContext, TrackingError> {
    state
        .active
        .get_mut(task_id)
        .ok_or_else(|| TrackingError::NotFound { id: task_id.clone() })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    fn tracker() -> ProgressTracker {
        ProgressTracker::new(TrackerConfig {
            stale_threshold: Duration::from_secs(120),
            max_active_contexts: 2,
            max_archived: 2,
            archive_retention: Duration::from_secs(3600),
            ..TrackerConfig::default()
        })
    }

    #[tokio::test]
    async fn progress_round_trip() {
        let tracker = tracker();
        let id = TaskId::from("t");
        tracker.start_task_tracking(id.clone(), None).await.unwrap();

        let ctx = tracker.get_context(&id).await.unwrap();
        assert_eq!(ctx.progress_percent, 0.0);
        assert_eq!(ctx.current_phase, "initializing");

        let stored = tracker
            .update_progress(&id, 150.0, "training", None)
            .await
            .unwrap();
        assert_eq!(stored, 100.0);
        let stored = tracker
            .update_progress(&id, 50.0, "training", Some(serde_json::json!({"loss": 0.3})))
            .await
            .unwrap();
        assert_eq!(stored, 50.0);

        tracker.complete_task_tracking(&id).await.unwrap();
        assert!(!tracker.is_active(&id).await);
        let ctx = tracker.get_context(&id).await.unwrap();
        assert_eq!(ctx.progress_percent, 100.0);
        assert_eq!(ctx.current_phase, "completed");
        assert_eq!(
            tracker.get_archived(&id).await.unwrap().outcome,
            TrackingOutcome::Completed
        );
    }

    #[tokio::test]
    async fn duplicate_and_capacity_rejected() {
        let tracker = tracker();
        tracker.start_task_tracking(TaskId::from("a"), None).await.unwrap();
        assert!(matches!(
            tracker.start_task_tracking(TaskId::from("a"), None).await,
            Err(TrackingError::AlreadyTracked { .. })
        ));
        tracker.start_task_tracking(TaskId::from("b"), None).await.unwrap();
        assert_eq!(
            tracker.start_task_tracking(TaskId::from("c"), None).await,
            Err(TrackingError::CapacityExceeded { max: 2 })
        );
        assert!(!tracker.has_capacity().await);
    }

    #[tokio::test]
    async fn stale_only_for_bound_workers() {
        let tracker = tracker();
        let t0 = Utc::now();
        tracker
            .start_task_tracking_at(TaskId::from("bound"), Some("w1".into()), t0)
            .await
            .unwrap();
        tracker
            .start_task_tracking_at(TaskId::from("queued"), None, t0)
            .await
            .unwrap();

        assert!(tracker.detect_stale_at(t0 + TimeDelta::seconds(60)).await.is_empty());
        let stale = tracker.detect_stale_at(t0 + TimeDelta::seconds(121)).await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].task_id, TaskId::from("bound"));
        assert_eq!(tracker.stats().await.stale, 1);

        // a fresh report clears the flag
        tracker
            .update_progress_at(&TaskId::from("bound"), 10.0, "training", None, t0 + TimeDelta::seconds(130))
            .await
            .unwrap();
        assert_eq!(tracker.stats().await.stale, 0);
    }

    #[tokio::test]
    async fn fail_keeps_error_and_archive_is_bounded() {
        let tracker = tracker();
        let now = Utc::now();
        for id in ["a", "b"] {
            tracker.start_task_tracking_at(TaskId::from(id), None, now).await.unwrap();
            tracker.fail_task_tracking_at(&TaskId::from(id), "oom", now).await.unwrap();
        }
        tracker.start_task_tracking_at(TaskId::from("c"), None, now).await.unwrap();
        tracker.cancel_task_tracking_at(&TaskId::from("c"), now).await.unwrap();

        assert_eq!(tracker.stats().await.archived, 2);
        assert!(tracker.get_context(&TaskId::from("a")).await.is_none());
        let b = tracker.get_context(&TaskId::from("b")).await.unwrap();
        assert_eq!(b.error.as_deref(), Some("oom"));
        assert_eq!(b.current_phase, "failed");

        assert_eq!(tracker.prune_archive_at(now + TimeDelta::seconds(3601)).await, 2);
    }

    #[tokio::test]
    async fn requeue_resets_and_discard_removes() {
        let tracker = tracker();
        let id = TaskId::from("t");
        let now = Utc::now();
        tracker.start_task_tracking_at(id.clone(), None, now).await.unwrap();
        tracker.bind_worker_at(&id, "w1", now).await.unwrap();
        tracker.update_progress_at(&id, 70.0, "training", None, now).await.unwrap();

        tracker.reset_for_requeue_at(&id, now).await.unwrap();
        let ctx = tracker.get_context(&id).await.unwrap();
        assert!(ctx.worker_id.is_none());
        assert_eq!(ctx.progress_percent, 0.0);
        assert_eq!(ctx.current_phase, "requeued");

        assert!(tracker.discard(&id).await);
        assert!(tracker.get_context(&id).await.is_none());
        assert!(matches!(
            tracker.update_progress(&id, 1.0, "x", None).await,
            Err(TrackingError::NotFound { .. })
        ));
    }
}
