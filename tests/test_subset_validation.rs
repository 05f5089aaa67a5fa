//! Stage subset validation: bad subsets are rejected before any agent runs

mod test_helpers;

use std::sync::Arc;
use takeoff_agents::agents::Stage;
use takeoff_agents::error::{ErrorKind, PipelineError};
use takeoff_agents::pipeline::{parse_stages, SubmitRequest};
use takeoff_agents::progress::NoOpProgress;
use takeoff_agents::service::TaskService;
use takeoff_agents::state::{RunStatus, ScopeItem, SeedData, TakeoffItem};
use takeoff_agents::testing::MockLlmProvider;
use test_helpers::orchestrator;

fn seeded_scope() -> SeedData {
    SeedData {
        scope_items: Some(vec![ScopeItem {
            id: "DW-1".to_string(),
            trade: "Drywall".to_string(),
            description: "Hang and finish 5/8 type X gypsum board".to_string(),
            source: Some("A-101.pdf".to_string()),
        }]),
        ..SeedData::default()
    }
}

fn assert_configuration_error(result: Result<impl std::fmt::Debug, PipelineError>) -> String {
    match result {
        Err(error) => {
            assert_eq!(error.kind(), Some(ErrorKind::Configuration), "{error}");
            error.to_string()
        }
        Ok(value) => panic!("expected a configuration error, got {value:?}"),
    }
}

#[tokio::test]
async fn test_estimator_alone_without_takeoff_is_rejected() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let orchestrator = orchestrator(llm.clone(), Arc::new(NoOpProgress));

    let request = SubmitRequest::new("price it").with_stages(vec![Stage::Estimator]);
    let message = assert_configuration_error(orchestrator.execute(request).await.map(|_| ()));

    assert!(message.contains("takeoff_data"), "{message}");
    assert_eq!(llm.total_calls().await, 0);
}

#[tokio::test]
async fn test_rejected_subset_is_never_registered() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let service = TaskService::new(Arc::new(orchestrator(llm.clone(), Arc::new(NoOpProgress))));

    let result = service
        .submit(SubmitRequest::default().with_stages(vec![Stage::Estimator]))
        .await;

    assert_configuration_error(result);
    assert_eq!(service.active_tasks().await, 0);
    assert_eq!(llm.total_calls().await, 0);
}

#[tokio::test]
async fn test_out_of_order_and_repeated_stages_are_rejected() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let orchestrator = orchestrator(llm, Arc::new(NoOpProgress));

    let reversed = SubmitRequest::default().with_stages(vec![Stage::TradeMapper, Stage::FileReader]);
    let message = assert_configuration_error(orchestrator.prepare(reversed));
    assert!(message.contains("must run before"), "{message}");

    let repeated = SubmitRequest::default().with_stages(vec![Stage::FileReader, Stage::FileReader]);
    let message = assert_configuration_error(orchestrator.prepare(repeated));
    assert!(message.contains("more than once"), "{message}");

    let empty = SubmitRequest::default().with_stages(vec![]);
    assert_configuration_error(orchestrator.prepare(empty));
}

#[tokio::test]
async fn test_seed_cannot_be_overwritten() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let orchestrator = orchestrator(llm, Arc::new(NoOpProgress));

    let request = SubmitRequest::default()
        .with_stages(vec![Stage::Scope, Stage::Takeoff])
        .with_seed(SeedData {
            trade_mapping: Some(vec![]),
            ..seeded_scope()
        });

    let message = assert_configuration_error(orchestrator.prepare(request));
    assert!(message.contains("overwrite seeded scope_items"), "{message}");
}

#[tokio::test]
async fn test_seeded_quick_estimate_runs() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let orchestrator = orchestrator(llm.clone(), Arc::new(NoOpProgress));

    let request = SubmitRequest::default()
        .with_stages(parse_stages("quick_estimate").unwrap())
        .with_seed(seeded_scope());
    let (_, state) = orchestrator.execute(request).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.agent_trace().len(), 2);
    assert_eq!(state.estimate().unwrap()[0].total, 3000.0);
    assert!(state.trade_mapping().is_none());
    assert_eq!(llm.calls_for(Stage::Scope).await, 0);
}

#[tokio::test]
async fn test_seeded_estimator_only_runs() {
    let llm = Arc::new(MockLlmProvider::with_construction_defaults());
    let orchestrator = orchestrator(llm, Arc::new(NoOpProgress));

    let request = SubmitRequest::default()
        .with_stages(vec![Stage::Estimator])
        .with_seed(SeedData {
            takeoff_data: Some(vec![TakeoffItem {
                scope_item_id: "DW-1".to_string(),
                description: "5/8 type X gypsum board".to_string(),
                quantity: 400.0,
                unit: "SF".to_string(),
            }]),
            ..SeedData::default()
        });
    let (_, state) = orchestrator.execute(request).await.unwrap();

    assert_eq!(state.status(), RunStatus::Completed);
    assert_eq!(state.estimate().unwrap()[0].total, 1000.0);
}

#[test]
fn test_parse_stage_lists() {
    assert_eq!(
        parse_stages("file_reader, trade_mapper").unwrap(),
        vec![Stage::FileReader, Stage::TradeMapper]
    );
    assert_eq!(parse_stages("full").unwrap().len(), 7);
    assert!(parse_stages("file_reader,painting").is_err());
}
