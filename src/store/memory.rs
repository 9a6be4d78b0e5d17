//! In-process `TaskStore` keeping serialized rows in maps.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::TaskStore;
use crate::task::{TaskDescriptor, TaskId};
use crate::tracking::ExecutionContext;

/// Rows are stored as JSON so reads hand out fresh copies, the same as a
/// database backend would.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, serde_json::Value>>,
    contexts: RwLock<HashMap<TaskId, serde_json::Value>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put_task(&self, descriptor: &TaskDescriptor) -> Result<(), StoreError> {
        let row = serde_json::to_value(descriptor)?;
        self.tasks
            .write()
            .await
            .insert(descriptor.task_id.clone(), row);
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskDescriptor>, StoreError> {
        let tasks = self.tasks.read().await;
        match tasks.get(task_id) {
            Some(row) => Ok(Some(serde_json::from_value(row.clone())?)),
            None => Ok(None),
        }
    }

    async fn put_context(&self, context: &ExecutionContext) -> Result<(), StoreError> {
        let row = serde_json::to_value(context)?;
        self.contexts
            .write()
            .await
            .insert(context.task_id.clone(), row);
        Ok(())
    }

    async fn get_context(
        &self,
        task_id: &TaskId,
    ) -> Result<Option<ExecutionContext>, StoreError> {
        let contexts = self.contexts.read().await;
        match contexts.get(task_id) {
            Some(row) => Ok(Some(serde_json::from_value(row.clone())?)),
            None => Ok(None),
        }
    }
}
