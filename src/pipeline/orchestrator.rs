//! Sequential stage runner
//!
//! One run moves its [`SharedState`] through each planned agent in order.
//! Between stages the orchestrator checks for cancellation; after each
//! successful stage it publishes progress. The run ends with exactly one task
//! store write and one terminal progress event, whatever the outcome.

use super::plan::{parse_stages, StagePlan};
use super::SubmitRequest;
use crate::agents::{Agent, AgentSettings, ModelSettings, Stage, StageContext};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StageError};
use crate::llm::LlmProvider;
use crate::observability::metrics;
use crate::progress::{ProgressBroadcaster, ProgressError};
use crate::retry::RetryPolicy;
use crate::state::{RunStatus, SharedState, TaskId};
use crate::store::TaskStore;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub struct Orchestrator {
    llm: Arc<dyn LlmProvider>,
    model: ModelSettings,
    retry: RetryPolicy,
    settings: AgentSettings,
    default_stages: Vec<Stage>,
    store: Arc<dyn TaskStore>,
    progress: Arc<dyn ProgressBroadcaster>,
}

impl Orchestrator {
    pub fn new(
        config: &PipelineConfig,
        llm: Arc<dyn LlmProvider>,
        store: Arc<dyn TaskStore>,
        progress: Arc<dyn ProgressBroadcaster>,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            llm,
            model: ModelSettings::from_config(config),
            retry: RetryPolicy::from_config(&config.pipeline.retry),
            settings: AgentSettings::from_config(config),
            default_stages: parse_stages(&config.pipeline.default_stages)?,
            store,
            progress,
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Build the initial state for a request and validate its stage subset
    pub fn prepare(&self, request: SubmitRequest) -> Result<(SharedState, StagePlan), PipelineError> {
        let stages = request
            .stages
            .unwrap_or_else(|| self.default_stages.clone());
        let state = SharedState::new(request.query, request.files).with_seed(request.seed);
        let plan = StagePlan::validate(&stages, &state)?;
        Ok((state, plan))
    }

    /// Validate, register and run a request to completion
    pub async fn execute(
        &self,
        request: SubmitRequest,
    ) -> Result<(TaskId, SharedState), PipelineError> {
        let (state, plan) = self.prepare(request)?;
        let task_id = Uuid::new_v4();
        self.store.create(task_id).await?;
        metrics().task_submitted();

        let state = self
            .run(task_id, state, &plan, &CancellationToken::new())
            .await;
        Ok((task_id, state))
    }

    /// Run `plan` over `state`. Never returns early with an error: every
    /// failure is recorded on the returned state.
    pub async fn run(
        &self,
        task_id: TaskId,
        state: SharedState,
        plan: &StagePlan,
        cancel: &CancellationToken,
    ) -> SharedState {
        let span = crate::task_span!(task_id = %task_id, stages = plan.len());
        self.run_stages(task_id, state, plan, cancel)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        task_id: TaskId,
        mut state: SharedState,
        plan: &StagePlan,
        cancel: &CancellationToken,
    ) -> SharedState {
        let started = Instant::now();
        metrics().task_started();
        info!(plan = %plan, "Task started");

        if let Err(error) = plan.check(&state) {
            state.fail(StageError::configuration(error.to_string()));
        } else {
            state.mark_in_progress();
            state = self.run_plan(task_id, state, plan, cancel).await;
        }

        self.finish(task_id, &state, started).await;
        state
    }

    async fn run_plan(
        &self,
        task_id: TaskId,
        mut state: SharedState,
        plan: &StagePlan,
        cancel: &CancellationToken,
    ) -> SharedState {
        let total = plan.len();
        let ctx = StageContext::new(
            task_id,
            self.llm.clone(),
            self.model.clone(),
            self.retry.clone(),
        );

        for (index, stage) in plan.stages().iter().copied().enumerate() {
            let ordinal = index + 1;
            if cancel.is_cancelled() {
                info!(next_stage = stage.name(), "Cancellation observed between stages");
                state.fail(StageError::cancelled(Some(stage)));
                metrics().task_cancelled();
                return state;
            }

            let agent = Agent::for_stage(stage, &self.settings);
            let stage_started = Instant::now();
            state = agent
                .process(state, &ctx)
                .instrument(crate::stage_span!(stage = stage.name(), ordinal, total))
                .await;

            let succeeded = state.error().is_none();
            metrics().stage_executed(stage.name(), stage_started.elapsed(), succeeded);
            if !succeeded {
                return state;
            }

            let message = state
                .agent_trace()
                .last()
                .map(|entry| entry.decision_summary.clone())
                .unwrap_or_default();
            if let Err(error) = self
                .progress
                .publish(task_id, stage, ordinal, total, &message)
                .await
            {
                log_progress_error(&error);
            }
        }

        state.mark_completed();
        state
    }

    /// The single terminal store write and progress event
    async fn finish(&self, task_id: TaskId, state: &SharedState, started: Instant) {
        let status = state.status();
        let outcome = state.outcome();
        let elapsed = started.elapsed();

        if let Err(error) = self.store.update(task_id, status, outcome.clone()).await {
            error!(error = %error, "Failed to record task outcome");
        }
        if let Err(error) = self
            .progress
            .publish_terminal(task_id, status, &outcome)
            .await
        {
            log_progress_error(&error);
        }

        match status {
            RunStatus::Completed => {
                metrics().task_completed(elapsed);
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    trace_entries = state.agent_trace().len(),
                    "Task completed"
                );
            }
            _ => {
                metrics().task_failed(elapsed);
                let reason = state.error().map(|e| e.to_string()).unwrap_or_default();
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %reason,
                    "Task failed"
                );
            }
        }
    }
}

fn log_progress_error(error: &ProgressError) {
    match error {
        ProgressError::NoSubscribers => debug!("No progress subscribers"),
        other => warn!(error = %other, "Progress delivery failed"),
    }
}
