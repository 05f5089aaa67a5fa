//! The seven pipeline stages
//!
//! Each stage is a small struct with one entry point, `process`, which takes
//! the task's [`SharedState`] by value and hands it back. [`Agent`] is the
//! closed set of stages the orchestrator dispatches over. Agents never return
//! errors: a failing agent records a [`StageError`] on the state, appends one
//! Error-level trace entry, leaves its output unset and returns.

pub mod estimator;
pub mod exporter;
pub mod file_reader;
pub mod llm_helpers;
pub mod prompts;
pub mod qa_validator;
pub mod scope;
pub mod takeoff;
pub mod trade_mapper;

pub use estimator::EstimatorAgent;
pub use exporter::ExporterAgent;
pub use file_reader::FileReaderAgent;
pub use qa_validator::QaValidatorAgent;
pub use scope::ScopeAgent;
pub use takeoff::TakeoffAgent;
pub use trade_mapper::TradeMapperAgent;

use crate::config::PipelineConfig;
use crate::error::StageError;
use crate::llm::{
    CompletionRequest, LlmError, LlmProvider, Message, METADATA_STAGE, METADATA_TASK_ID,
};
use crate::observability::metrics::metrics;
use crate::retry::{RetryError, RetryPolicy};
use crate::state::{ExportFormat, SharedState, StateError, StateField, TaskId, TraceEntry, TraceLevel};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pipeline stages in canonical order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    FileReader,
    TradeMapper,
    Scope,
    Takeoff,
    Estimator,
    QaValidator,
    Exporter,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::FileReader,
        Stage::TradeMapper,
        Stage::Scope,
        Stage::Takeoff,
        Stage::Estimator,
        Stage::QaValidator,
        Stage::Exporter,
    ];

    /// Agent name as it appears in trace entries
    pub fn name(&self) -> &'static str {
        match self {
            Stage::FileReader => "FileReader",
            Stage::TradeMapper => "TradeMapper",
            Stage::Scope => "Scope",
            Stage::Takeoff => "Takeoff",
            Stage::Estimator => "Estimator",
            Stage::QaValidator => "QAValidator",
            Stage::Exporter => "Exporter",
        }
    }

    /// Snake-case key used in config, request bodies and LLM metadata
    pub fn key(&self) -> &'static str {
        match self {
            Stage::FileReader => "file_reader",
            Stage::TradeMapper => "trade_mapper",
            Stage::Scope => "scope",
            Stage::Takeoff => "takeoff",
            Stage::Estimator => "estimator",
            Stage::QaValidator => "qa_validator",
            Stage::Exporter => "exporter",
        }
    }

    /// Zero-based position in the canonical order
    pub fn ordinal(&self) -> usize {
        *self as usize
    }

    /// Fields that must be populated before this stage can run
    pub fn requires(&self) -> &'static [StateField] {
        match self {
            Stage::FileReader => &[],
            Stage::TradeMapper => &[StateField::ProcessedFileContent],
            Stage::Scope => &[StateField::TradeMapping],
            Stage::Takeoff => &[StateField::ScopeItems],
            Stage::Estimator => &[StateField::TakeoffData],
            Stage::QaValidator => &[
                StateField::ScopeItems,
                StateField::TakeoffData,
                StateField::Estimate,
            ],
            Stage::Exporter => &[StateField::Estimate],
        }
    }

    /// The single field this stage owns
    pub fn produces(&self) -> StateField {
        match self {
            Stage::FileReader => StateField::ProcessedFileContent,
            Stage::TradeMapper => StateField::TradeMapping,
            Stage::Scope => StateField::ScopeItems,
            Stage::Takeoff => StateField::TakeoffData,
            Stage::Estimator => StateField::Estimate,
            Stage::QaValidator => StateField::QaReport,
            Stage::Exporter => StateField::Export,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStage(pub String);

impl fmt::Display for UnknownStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown stage '{}'", self.0)
    }
}

impl std::error::Error for UnknownStage {}

impl FromStr for Stage {
    type Err = UnknownStage;

    /// Accepts the snake-case key or the agent name, case-insensitively
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| {
                stage.key().eq_ignore_ascii_case(wanted) || stage.name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| UnknownStage(wanted.to_string()))
    }
}

/// Model parameters applied to every stage's LLM request
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            model: config.llm.model.clone(),
            temperature: config.llm.temperature,
            max_tokens: config.llm.max_tokens,
        }
    }
}

/// Per-agent knobs taken from the `[pipeline]` config section
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSettings {
    pub max_file_bytes: u64,
    pub qa_confidence_threshold: f64,
    pub export_format: ExportFormat,
}

impl AgentSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_file_bytes: config.pipeline.max_file_bytes,
            qa_confidence_threshold: config.pipeline.qa.confidence_threshold,
            export_format: config.pipeline.export.format,
        }
    }
}

/// Everything a stage may use besides the state itself
pub struct StageContext {
    task_id: TaskId,
    llm: Arc<dyn LlmProvider>,
    model: ModelSettings,
    retry: RetryPolicy,
}

impl StageContext {
    pub fn new(
        task_id: TaskId,
        llm: Arc<dyn LlmProvider>,
        model: ModelSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            task_id,
            llm,
            model,
            retry,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Send one system/user exchange on behalf of `stage` and return the
    /// reply text. Transient failures are retried per the orchestrator's
    /// policy.
    pub async fn complete(
        &self,
        stage: Stage,
        system: &str,
        user: String,
    ) -> Result<String, StageError> {
        let mut metadata = HashMap::new();
        metadata.insert(METADATA_STAGE.to_string(), stage.key().to_string());
        metadata.insert(METADATA_TASK_ID.to_string(), self.task_id.to_string());

        let request = CompletionRequest {
            messages: vec![Message::system(system), Message::user(user)],
            model: self.model.model.clone(),
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
            metadata,
        };

        let llm = &self.llm;
        let request = &request;
        let outcome = self
            .retry
            .run(stage.name(), move || async move {
                let result = llm.complete(request.clone()).await;
                metrics().llm_call(result.is_ok());
                result
            })
            .await;

        let response = outcome.map_err(|error| llm_failure(stage, error))?;
        debug!(
            stage = stage.name(),
            model = %response.model,
            tokens = response.usage.total_tokens,
            "LLM reply received"
        );

        response
            .content
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| StageError::validation(stage, "LLM returned an empty reply"))
    }
}

fn llm_failure(stage: Stage, error: RetryError) -> StageError {
    match &error {
        RetryError::Exhausted { .. } => {
            StageError::transient_io(stage, format!("LLM call failed: {error}"))
        }
        RetryError::Permanent(LlmError::InvalidRequest(_) | LlmError::InvalidResponse(_)) => {
            StageError::validation(stage, format!("LLM call rejected: {error}"))
        }
        RetryError::Permanent(_) => {
            StageError::transient_io(stage, format!("LLM call failed without retry: {error}"))
        }
    }
}

/// What a successful stage hands back for the shared state
pub(crate) struct StageOutput<T> {
    pub value: T,
    pub level: TraceLevel,
    pub summary: String,
    pub detail: Value,
}

impl<T> StageOutput<T> {
    pub fn info(value: T, summary: impl Into<String>, detail: Value) -> Self {
        Self {
            value,
            level: TraceLevel::Info,
            summary: summary.into(),
            detail,
        }
    }

    pub fn warning(value: T, summary: impl Into<String>, detail: Value) -> Self {
        Self {
            value,
            level: TraceLevel::Warning,
            summary: summary.into(),
            detail,
        }
    }
}

/// Write a stage's output into its owned field and log the decision
pub(crate) fn commit<T>(
    mut state: SharedState,
    stage: Stage,
    output: StageOutput<T>,
    set: fn(&mut SharedState, T) -> Result<(), StateError>,
) -> SharedState {
    if let Err(error) = set(&mut state, output.value) {
        return reject(state, StageError::validation(stage, error.to_string()));
    }
    state.push_trace(TraceEntry::new(
        stage.name(),
        output.level,
        output.summary,
        output.detail,
    ));
    state
}

/// Record a stage failure: one Error trace entry, then the error itself
pub(crate) fn reject(mut state: SharedState, error: StageError) -> SharedState {
    let stage_name = error.stage.map(|s| s.name()).unwrap_or("Pipeline");
    warn!(stage = stage_name, kind = %error.kind, error = %error.message, "Stage failed");
    state.push_trace(TraceEntry::new(
        stage_name,
        TraceLevel::Error,
        error.message.clone(),
        json!({ "kind": error.kind }),
    ));
    state.fail(error);
    state
}

/// Borrow a required upstream field or fail with a validation error
pub(crate) fn required<T: ?Sized>(
    stage: Stage,
    field: StateField,
    value: Option<&T>,
) -> Result<&T, StageError> {
    value.ok_or_else(|| {
        StageError::validation(stage, format!("required input {field} is not populated"))
    })
}

/// The closed set of pipeline agents
#[derive(Debug, Clone)]
pub enum Agent {
    FileReader(FileReaderAgent),
    TradeMapper(TradeMapperAgent),
    Scope(ScopeAgent),
    Takeoff(TakeoffAgent),
    Estimator(EstimatorAgent),
    QaValidator(QaValidatorAgent),
    Exporter(ExporterAgent),
}

impl Agent {
    pub fn for_stage(stage: Stage, settings: &AgentSettings) -> Self {
        match stage {
            Stage::FileReader => Agent::FileReader(FileReaderAgent::new(settings.max_file_bytes)),
            Stage::TradeMapper => Agent::TradeMapper(TradeMapperAgent),
            Stage::Scope => Agent::Scope(ScopeAgent),
            Stage::Takeoff => Agent::Takeoff(TakeoffAgent),
            Stage::Estimator => Agent::Estimator(EstimatorAgent),
            Stage::QaValidator => {
                Agent::QaValidator(QaValidatorAgent::new(settings.qa_confidence_threshold))
            }
            Stage::Exporter => Agent::Exporter(ExporterAgent::new(settings.export_format)),
        }
    }

    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match self {
            Agent::FileReader(agent) => agent.process(state, ctx).await,
            Agent::TradeMapper(agent) => agent.process(state, ctx).await,
            Agent::Scope(agent) => agent.process(state, ctx).await,
            Agent::Takeoff(agent) => agent.process(state, ctx).await,
            Agent::Estimator(agent) => agent.process(state, ctx).await,
            Agent::QaValidator(agent) => agent.process(state, ctx).await,
            Agent::Exporter(agent) => agent.process(state, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_matches_ordinals() {
        for (index, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.ordinal(), index);
        }
    }

    #[test]
    fn test_every_requirement_is_produced_upstream() {
        for stage in Stage::ALL {
            for field in stage.requires() {
                let producer = Stage::ALL
                    .into_iter()
                    .find(|s| s.produces() == *field)
                    .expect("every required field has a producer");
                assert!(producer < stage, "{producer} must precede {stage}");
            }
        }
    }

    #[test]
    fn test_parse_stage_names() {
        assert_eq!("file_reader".parse::<Stage>(), Ok(Stage::FileReader));
        assert_eq!("QAValidator".parse::<Stage>(), Ok(Stage::QaValidator));
        assert_eq!(" takeoff ".parse::<Stage>(), Ok(Stage::Takeoff));
        assert_eq!(
            "painting".parse::<Stage>(),
            Err(UnknownStage("painting".into()))
        );
    }

    #[test]
    fn test_stage_serializes_as_key() {
        assert_eq!(
            serde_json::to_string(&Stage::QaValidator).unwrap(),
            "\"qa_validator\""
        );
    }

    #[test]
    fn test_reject_records_trace_and_error() {
        let state = SharedState::new(None, vec![]);
        let state = reject(state, StageError::validation(Stage::Scope, "bad trades"));

        assert_eq!(state.agent_trace().len(), 1);
        assert_eq!(state.agent_trace()[0].agent_name, "Scope");
        assert_eq!(state.agent_trace()[0].level, TraceLevel::Error);
        assert_eq!(state.error().map(|e| e.stage), Some(Some(Stage::Scope)));
    }

    #[test]
    fn test_commit_refuses_overwrite() {
        let mut state = SharedState::new(None, vec![]);
        state.set_scope_items(vec![]).unwrap();

        let state = commit(
            state,
            Stage::Scope,
            StageOutput::info(vec![], "again", json!({})),
            SharedState::set_scope_items,
        );

        assert!(state.error().is_some());
        assert_eq!(state.agent_trace()[0].level, TraceLevel::Error);
    }
}
