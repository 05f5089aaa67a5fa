//! Inbound task surface: submit, poll, cancel and wait
//!
//! Each submitted task runs on its own tokio task with its own cancellation
//! token. Concurrent tasks share only the task store and the progress
//! broadcaster held by the orchestrator.

use crate::error::PipelineError;
use crate::observability::metrics;
use crate::pipeline::Orchestrator;
use crate::state::TaskId;
use crate::store::{StoreError, TaskSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub use crate::pipeline::SubmitRequest;

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TaskService {
    orchestrator: Arc<Orchestrator>,
    running: Mutex<HashMap<TaskId, RunningTask>>,
}

impl TaskService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Validate the request, register the task and start it in the
    /// background. An invalid stage subset is rejected here, before any agent
    /// runs.
    pub async fn submit(&self, request: SubmitRequest) -> Result<TaskId, PipelineError> {
        let (state, plan) = self.orchestrator.prepare(request)?;
        let task_id = Uuid::new_v4();
        self.orchestrator.store().create(task_id).await?;
        metrics().task_submitted();
        info!(%task_id, plan = %plan, "Task submitted");

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move {
            orchestrator.run(task_id, state, &plan, &token).await;
        });

        let mut running = self.running.lock().await;
        running.retain(|_, task| !task.handle.is_finished());
        running.insert(task_id, RunningTask { cancel, handle });
        Ok(task_id)
    }

    /// Request cancellation; the run stops before its next stage. Returns
    /// false when the task is unknown or already finished.
    pub async fn cancel(&self, task_id: TaskId) -> Result<bool, PipelineError> {
        let snapshot = self.status(task_id).await?;
        if snapshot.is_terminal() {
            return Ok(false);
        }

        match self.running.lock().await.get(&task_id) {
            Some(task) if !task.handle.is_finished() => {
                task.cancel.cancel();
                info!(%task_id, "Cancellation requested");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskSnapshot, PipelineError> {
        self.orchestrator
            .store()
            .get(task_id)
            .await
            .map_err(|error| match error {
                StoreError::NotFound(id) => PipelineError::TaskNotFound(id),
                other => PipelineError::Store(other),
            })
    }

    /// Wait for the task's run to finish and return its final snapshot
    pub async fn wait(&self, task_id: TaskId) -> Result<TaskSnapshot, PipelineError> {
        let task = self.running.lock().await.remove(&task_id);
        if let Some(task) = task {
            if let Err(error) = task.handle.await {
                warn!(%task_id, error = %error, "Task run aborted");
                return Err(PipelineError::internal(format!(
                    "task {task_id} did not finish: {error}"
                )));
            }
        }
        self.status(task_id).await
    }

    /// Number of runs still executing
    pub async fn active_tasks(&self) -> usize {
        self.running
            .lock()
            .await
            .values()
            .filter(|task| !task.handle.is_finished())
            .count()
    }
}
