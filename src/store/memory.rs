//! Process-local task store

use super::{StoreError, TaskSnapshot, TaskStore};
use crate::state::{RunStatus, TaskId, TaskOutcome};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// The outer lock only guards insert and lookup; each task's record has its
/// own mutex so writes to different tasks never contend.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<Mutex<TaskSnapshot>>>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }

    async fn record(&self, task_id: TaskId) -> Result<Arc<Mutex<TaskSnapshot>>, StoreError> {
        self.tasks
            .read()
            .await
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::NotFound(task_id))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task_id: TaskId) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task_id) {
            return Err(StoreError::AlreadyExists(task_id));
        }
        tasks.insert(task_id, Arc::new(Mutex::new(TaskSnapshot::pending(task_id))));
        debug!(%task_id, "Task created");
        Ok(())
    }

    async fn update(
        &self,
        task_id: TaskId,
        status: RunStatus,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::NotTerminal(task_id, status));
        }

        let record = self.record(task_id).await?;
        let mut snapshot = record.lock().await;
        if snapshot.is_terminal() {
            return Err(StoreError::AlreadyTerminal(task_id));
        }

        snapshot.status = status;
        snapshot.result = Some(outcome.result);
        snapshot.error = outcome.error;
        snapshot.updated_at = Utc::now();
        debug!(%task_id, %status, "Task finished");
        Ok(())
    }

    async fn get(&self, task_id: TaskId) -> Result<TaskSnapshot, StoreError> {
        let record = self.record(task_id).await?;
        let snapshot = record.lock().await.clone();
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_create_then_get_is_pending() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.unwrap();

        let snapshot = store.get(id).await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Pending);
        assert!(snapshot.result.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.unwrap();
        assert_eq!(store.create(id).await, Err(StoreError::AlreadyExists(id)));
    }

    #[tokio::test]
    async fn test_terminal_write_accepted_once() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.unwrap();
        let outcome = SharedState::new(None, vec![]).outcome();

        store
            .update(id, RunStatus::Completed, outcome.clone())
            .await
            .unwrap();
        assert_eq!(
            store.update(id, RunStatus::Failed, outcome).await,
            Err(StoreError::AlreadyTerminal(id))
        );
        assert_eq!(store.get(id).await.unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_non_terminal_update_rejected() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        store.create(id).await.unwrap();
        let outcome = SharedState::new(None, vec![]).outcome();

        assert!(matches!(
            store.update(id, RunStatus::InProgress, outcome).await,
            Err(StoreError::NotTerminal(_, RunStatus::InProgress))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let store = InMemoryTaskStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.get(id).await, Err(StoreError::NotFound(id)));
    }
}
