//! Mock implementations for testing
//!
//! Provides a scripted LlmProvider and recording/failing progress broadcasters
//! so the pipeline can be exercised without network access.

use crate::agents::{ModelSettings, Stage, StageContext};
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, FinishReason, LlmError, LlmProvider, TokenUsage,
    METADATA_STAGE,
};
use crate::progress::{ProgressBroadcaster, ProgressError, ProgressEvent};
use crate::retry::RetryPolicy;
use crate::state::{RunStatus, TaskId, TaskOutcome};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const FILE_READER_REPLY: &str = r#"{"summary":"Architectural floor plan with partition types","sections":["Partition schedule","Door schedule"]}"#;

pub const TRADE_MAPPER_REPLY: &str = r#"[{"trade":"Drywall","csi_division":"09 21 16","source":"A-101.pdf","rationale":"Partition types call for gypsum board"}]"#;

pub const SCOPE_REPLY: &str = r#"[{"id":"DW-1","trade":"Drywall","description":"Hang and finish 5/8 type X gypsum board","source":"A-101.pdf"}]"#;

pub const TAKEOFF_REPLY: &str =
    r#"[{"scope_item_id":"DW-1","description":"5/8 type X gypsum board","quantity":1200,"unit":"SF"}]"#;

pub const ESTIMATOR_REPLY: &str = r#"[{"scope_item_id":"DW-1","unit_cost":2.5}]"#;

pub const QA_VALIDATOR_REPLY: &str = r#"{"confidence":0.92,"issues":[]}"#;

type Responder = Arc<dyn Fn(&CompletionRequest) -> String + Send + Sync>;

#[derive(Clone)]
enum Reply {
    Fixed(String),
    Computed(Responder),
}

/// LLM provider scripted per stage
///
/// The stage is read from the request's `stage` metadata, so one mock can
/// serve a whole run. Stages without a scripted reply get a permanent
/// `InvalidRequest` error.
#[derive(Default)]
pub struct MockLlmProvider {
    replies: HashMap<Stage, Reply>,
    failures: Mutex<HashMap<Stage, (u32, LlmError)>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies that carry one drywall item through every stage
    pub fn with_construction_defaults() -> Self {
        Self::new()
            .with_reply(Stage::FileReader, FILE_READER_REPLY)
            .with_reply(Stage::TradeMapper, TRADE_MAPPER_REPLY)
            .with_reply(Stage::Scope, SCOPE_REPLY)
            .with_reply(Stage::Takeoff, TAKEOFF_REPLY)
            .with_reply(Stage::Estimator, ESTIMATOR_REPLY)
            .with_reply(Stage::QaValidator, QA_VALIDATOR_REPLY)
    }

    pub fn with_reply(mut self, stage: Stage, reply: impl Into<String>) -> Self {
        self.replies.insert(stage, Reply::Fixed(reply.into()));
        self
    }

    /// Reply computed from the request, for tests where tasks must differ
    pub fn with_responder<F>(mut self, stage: Stage, responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> String + Send + Sync + 'static,
    {
        self.replies
            .insert(stage, Reply::Computed(Arc::new(responder)));
        self
    }

    /// Fail the next `times` calls for `stage` with `error`
    pub fn failing_times(mut self, stage: Stage, times: u32, error: LlmError) -> Self {
        self.failures.get_mut().insert(stage, (times, error));
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    pub async fn total_calls(&self) -> usize {
        self.requests.lock().await.len()
    }

    pub async fn calls_for(&self, stage: Stage) -> usize {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|request| stage_of(request) == Some(stage))
            .count()
    }
}

fn stage_of(request: &CompletionRequest) -> Option<Stage> {
    request
        .metadata
        .get(METADATA_STAGE)
        .and_then(|key| key.parse().ok())
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().await.push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let stage = stage_of(&request)
            .ok_or_else(|| LlmError::InvalidRequest("request has no stage metadata".into()))?;

        {
            let mut failures = self.failures.lock().await;
            if let Some((remaining, error)) = failures.get_mut(&stage) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
        }

        let content = match self.replies.get(&stage) {
            Some(Reply::Fixed(text)) => text.clone(),
            Some(Reply::Computed(responder)) => responder(&request),
            None => {
                return Err(LlmError::InvalidRequest(format!(
                    "no scripted reply for {}",
                    stage.key()
                )))
            }
        };

        Ok(CompletionResponse {
            content: Some(content),
            model: request.model,
            usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            finish_reason: FinishReason::Stop,
            metadata: HashMap::new(),
        })
    }

    async fn health_check(&self) -> Result<(), LlmError> {
        Ok(())
    }
}

/// Stage context with a fast retry policy
pub fn test_context(llm: Arc<MockLlmProvider>) -> StageContext {
    StageContext::new(
        Uuid::new_v4(),
        llm,
        ModelSettings {
            model: "mock-model".into(),
            temperature: None,
            max_tokens: None,
        },
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2)),
    )
}

/// Minimal uncompressed PDF whose only shown text is `text`
pub fn sample_pdf(text: &str) -> Vec<u8> {
    let escaped = text
        .replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)");
    let stream = format!("BT /F1 12 Tf 72 712 Td ({escaped}) Tj ET");
    format!(
        "%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
         4 0 obj\n<< /Length {} >>\nstream\n{stream}\nendstream\nendobj\ntrailer\n<< /Root 1 0 R >>\n%%EOF\n",
        stream.len()
    )
    .into_bytes()
}

/// Broadcaster that keeps every event, optionally cancelling a token once a
/// given stage has been published
#[derive(Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    cancel_after: Option<(Stage, CancellationToken)>,
}

impl RecordingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_after(stage: Stage, token: CancellationToken) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            cancel_after: Some((stage, token)),
        }
    }

    pub async fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_for(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProgressBroadcaster for RecordingProgress {
    async fn publish(
        &self,
        task_id: TaskId,
        stage: Stage,
        ordinal: usize,
        total: usize,
        message: &str,
    ) -> Result<(), ProgressError> {
        self.events.lock().await.push(ProgressEvent::stage_completed(
            task_id, stage, ordinal, total, message,
        ));
        if let Some((after, token)) = &self.cancel_after {
            if *after == stage {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn publish_terminal(
        &self,
        task_id: TaskId,
        status: RunStatus,
        outcome: &TaskOutcome,
    ) -> Result<(), ProgressError> {
        self.events
            .lock()
            .await
            .push(ProgressEvent::terminal(task_id, status, outcome));
        Ok(())
    }
}

/// Broadcaster whose every delivery fails
#[derive(Debug, Default)]
pub struct FailingProgress;

#[async_trait]
impl ProgressBroadcaster for FailingProgress {
    async fn publish(
        &self,
        _task_id: TaskId,
        _stage: Stage,
        _ordinal: usize,
        _total: usize,
        _message: &str,
    ) -> Result<(), ProgressError> {
        Err(ProgressError::Delivery("socket closed".into()))
    }

    async fn publish_terminal(
        &self,
        _task_id: TaskId,
        _status: RunStatus,
        _outcome: &TaskOutcome,
    ) -> Result<(), ProgressError> {
        Err(ProgressError::Delivery("socket closed".into()))
    }
}
