//! `TaskStore` trait: single async interface for task persistence.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::{TaskDescriptor, TaskId};
use crate::tracking::ExecutionContext;

/// Backend-agnostic store for task descriptors and their execution contexts.
///
/// Writes are upserts keyed by task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert or replace a descriptor.
    async fn put_task(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError>;

    // ── Contexts ────────────────────────────────────────────────────

    /// Insert or replace the last known execution context of a task.
    async fn put_context(&self, context: &ExecutionContext) -> Result<(), StoreError>;

    async fn get_context(&self, task_id: &TaskId)
    -> Result<Option<ExecutionContext>, StoreError>;
}
