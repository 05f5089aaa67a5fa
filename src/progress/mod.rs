//! Progress reporting for running tasks
//!
//! The orchestrator calls a [`ProgressBroadcaster`] after every stage and once
//! when a run reaches a terminal status. Delivery is best effort: a broadcaster
//! error is logged by the caller and never aborts the pipeline.

use crate::agents::Stage;
use crate::error::StageError;
use crate::state::{RunStatus, TaskId, TaskOutcome, TaskResult};
use crate::store::TaskSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod broadcast;
pub use broadcast::{ChannelBroadcaster, TaskEvents};

/// Progress settings share the `[progress]` config section
pub type ProgressConfig = crate::config::ProgressSection;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    StageCompleted,
    Terminal,
}

/// One message on the progress stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
    pub kind: ProgressEventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    /// 1-based position of the stage within the run's plan
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordinal: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageError>,
}

impl ProgressEvent {
    pub fn stage_completed(
        task_id: TaskId,
        stage: Stage,
        ordinal: usize,
        total: usize,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            timestamp: Utc::now(),
            kind: ProgressEventKind::StageCompleted,
            stage: Some(stage),
            ordinal: Some(ordinal),
            total: Some(total),
            message: message.into(),
            status: Some(RunStatus::InProgress),
            result: None,
            error: None,
        }
    }

    pub fn terminal(task_id: TaskId, status: RunStatus, outcome: &TaskOutcome) -> Self {
        let message = match &outcome.error {
            Some(error) => error.to_string(),
            None => format!("Task {status}"),
        };
        Self {
            task_id,
            timestamp: Utc::now(),
            kind: ProgressEventKind::Terminal,
            stage: None,
            ordinal: None,
            total: None,
            message,
            status: Some(status),
            result: Some(outcome.result.clone()),
            error: outcome.error.clone(),
        }
    }

    /// Terminal event rebuilt from a finished task's stored record
    pub fn from_snapshot(snapshot: &TaskSnapshot) -> Option<Self> {
        if !snapshot.is_terminal() {
            return None;
        }
        let outcome = TaskOutcome {
            result: snapshot.result.clone()?,
            error: snapshot.error.clone(),
        };
        Some(Self::terminal(snapshot.task_id, snapshot.status, &outcome))
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == ProgressEventKind::Terminal
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    #[error("No subscribers for task progress")]
    NoSubscribers,

    #[error("Progress delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait ProgressBroadcaster: Send + Sync {
    /// Report that `stage` finished successfully
    async fn publish(
        &self,
        task_id: TaskId,
        stage: Stage,
        ordinal: usize,
        total: usize,
        message: &str,
    ) -> Result<(), ProgressError>;

    /// Report the run's final status with its result or error
    async fn publish_terminal(
        &self,
        task_id: TaskId,
        status: RunStatus,
        outcome: &TaskOutcome,
    ) -> Result<(), ProgressError>;
}

/// Broadcaster that drops everything
pub struct NoOpProgress;

#[async_trait]
impl ProgressBroadcaster for NoOpProgress {
    async fn publish(
        &self,
        _task_id: TaskId,
        _stage: Stage,
        _ordinal: usize,
        _total: usize,
        _message: &str,
    ) -> Result<(), ProgressError> {
        Ok(())
    }

    async fn publish_terminal(
        &self,
        _task_id: TaskId,
        _status: RunStatus,
        _outcome: &TaskOutcome,
    ) -> Result<(), ProgressError> {
        Ok(())
    }
}
