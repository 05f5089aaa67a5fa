//! In-process fan-out of progress events over a tokio broadcast channel

use super::{ProgressBroadcaster, ProgressConfig, ProgressError, ProgressEvent};
use crate::agents::Stage;
use crate::observability::metrics;
use crate::state::{RunStatus, TaskId, TaskOutcome};
use crate::store::TaskStore;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Publishes every task's events on one channel; subscribers filter by task
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: broadcast::Sender<ProgressEvent>,
    enabled: bool,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            enabled: true,
        }
    }

    pub fn from_config(config: &ProgressConfig) -> Self {
        let mut broadcaster = Self::new(config.channel_capacity);
        broadcaster.enabled = config.enabled;
        broadcaster
    }

    /// Receive events for every task
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Receive events for one task, ending after its terminal event
    pub fn subscribe_task(&self, task_id: TaskId) -> TaskEvents {
        TaskEvents {
            task_id,
            receiver: self.sender.subscribe(),
            store: None,
            finished: false,
        }
    }

    fn send(&self, event: ProgressEvent) -> Result<(), ProgressError> {
        if !self.enabled {
            return Ok(());
        }
        match self.sender.send(event) {
            Ok(receivers) => {
                debug!(receivers, "Progress event published");
                metrics().progress_published();
                Ok(())
            }
            Err(_) => {
                metrics().progress_dropped();
                Err(ProgressError::NoSubscribers)
            }
        }
    }
}

#[async_trait]
impl ProgressBroadcaster for ChannelBroadcaster {
    async fn publish(
        &self,
        task_id: TaskId,
        stage: Stage,
        ordinal: usize,
        total: usize,
        message: &str,
    ) -> Result<(), ProgressError> {
        self.send(ProgressEvent::stage_completed(
            task_id, stage, ordinal, total, message,
        ))
    }

    async fn publish_terminal(
        &self,
        task_id: TaskId,
        status: RunStatus,
        outcome: &TaskOutcome,
    ) -> Result<(), ProgressError> {
        self.send(ProgressEvent::terminal(task_id, status, outcome))
    }
}

/// Event stream for a single task
pub struct TaskEvents {
    task_id: TaskId,
    receiver: broadcast::Receiver<ProgressEvent>,
    store: Option<Arc<dyn TaskStore>>,
    finished: bool,
}

impl TaskEvents {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Fall back to the stored record when the channel drops events, so a
    /// lagging subscriber still receives the terminal event
    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The terminal event from the store, if the task has finished. The
    /// store is written before the terminal event is published, so a dropped
    /// terminal event is always recoverable here.
    async fn recover_terminal(&self) -> Option<ProgressEvent> {
        let store = self.store.as_ref()?;
        match store.get(self.task_id).await {
            Ok(snapshot) => ProgressEvent::from_snapshot(&snapshot),
            Err(error) => {
                debug!(task_id = %self.task_id, error = %error, "No stored record to recover from");
                None
            }
        }
    }

    /// Next event for this task, or `None` once the terminal event has been
    /// delivered or the broadcaster is gone
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.task_id == self.task_id => {
                    self.finished = event.is_terminal();
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(task_id = %self.task_id, skipped, "Progress subscriber lagged");
                    metrics().progress_dropped();
                    if let Some(event) = self.recover_terminal().await {
                        self.finished = true;
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
