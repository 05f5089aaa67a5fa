//! Task store: task id to status/result mapping for asynchronous retrieval
//!
//! The orchestrator writes each task exactly twice: once at creation and once
//! at its terminal transition. Per-stage progress goes through the
//! broadcaster instead.

use crate::error::StageError;
use crate::state::{RunStatus, TaskId, TaskOutcome, TaskResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub use memory::InMemoryTaskStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("Task {0} not found")]
    NotFound(TaskId),

    #[error("Task {0} already reached a terminal status")]
    AlreadyTerminal(TaskId),

    #[error("Status {1} is not terminal for task {0}")]
    NotTerminal(TaskId, RunStatus),
}

/// What a poller sees for one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: RunStatus,
    /// Set at the terminal write; on failure it holds the partial trace
    pub result: Option<TaskResult>,
    pub error: Option<StageError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskSnapshot {
    pub fn pending(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: RunStatus::Pending,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Register a new task as pending
    async fn create(&self, task_id: TaskId) -> Result<(), StoreError>;

    /// Record the terminal status and outcome; accepted once per task
    async fn update(
        &self,
        task_id: TaskId,
        status: RunStatus,
        outcome: TaskOutcome,
    ) -> Result<(), StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<TaskSnapshot, StoreError>;
}
