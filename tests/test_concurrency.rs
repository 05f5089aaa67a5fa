//! Concurrent tasks share the provider, store and broadcaster but never state

mod test_helpers;

use std::sync::Arc;
use std::time::Duration;
use takeoff_agents::pipeline::SubmitRequest;
use takeoff_agents::progress::ChannelBroadcaster;
use takeoff_agents::service::TaskService;
use takeoff_agents::state::{RunStatus, TaskResult};
use takeoff_agents::testing::RecordingProgress;
use test_helpers::{orchestrator, trade_aware_llm};

fn trades(result: &TaskResult) -> Vec<String> {
    result
        .trade_mapping
        .as_ref()
        .map(|trades| trades.iter().map(|t| t.trade.clone()).collect())
        .unwrap_or_default()
}

fn scope_ids(result: &TaskResult) -> Vec<String> {
    result
        .estimate
        .as_ref()
        .map(|lines| lines.iter().map(|l| l.scope_item_id.clone()).collect())
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_do_not_leak_state() {
    let llm = Arc::new(trade_aware_llm().with_delay(Duration::from_millis(5)));
    let progress = Arc::new(RecordingProgress::new());
    let service = Arc::new(TaskService::new(Arc::new(orchestrator(
        llm,
        progress.clone(),
    ))));

    let drywall = service
        .submit(SubmitRequest::new("drywall takeoff for level 2"))
        .await
        .unwrap();
    let plumbing = service
        .submit(SubmitRequest::new("plumbing rough-in for level 2"))
        .await
        .unwrap();
    assert_ne!(drywall, plumbing);

    let (drywall_snapshot, plumbing_snapshot) =
        tokio::join!(service.wait(drywall), service.wait(plumbing));
    let drywall_snapshot = drywall_snapshot.unwrap();
    let plumbing_snapshot = plumbing_snapshot.unwrap();

    assert_eq!(drywall_snapshot.status, RunStatus::Completed);
    assert_eq!(plumbing_snapshot.status, RunStatus::Completed);

    let drywall_result = drywall_snapshot.result.unwrap();
    let plumbing_result = plumbing_snapshot.result.unwrap();
    assert_eq!(trades(&drywall_result), vec!["Drywall"]);
    assert_eq!(trades(&plumbing_result), vec!["Plumbing"]);
    assert_eq!(scope_ids(&drywall_result), vec!["DW-1"]);
    assert_eq!(scope_ids(&plumbing_result), vec!["PL-1"]);
    assert_eq!(drywall_result.agent_trace.len(), 7);
    assert_eq!(plumbing_result.agent_trace.len(), 7);

    for task_id in [drywall, plumbing] {
        let events = progress.events_for(task_id).await;
        assert_eq!(events.len(), 8);
        assert!(events.iter().all(|event| event.task_id == task_id));
        assert!(events.last().unwrap().is_terminal());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_tasks_complete_independently() {
    let llm = Arc::new(trade_aware_llm());
    let broadcaster = Arc::new(ChannelBroadcaster::new(64));
    let service = Arc::new(TaskService::new(Arc::new(orchestrator(
        llm,
        broadcaster.clone(),
    ))));

    let mut handles = Vec::new();
    for index in 0..8 {
        let service = service.clone();
        let query = if index % 2 == 0 {
            format!("drywall takeoff, area {index}")
        } else {
            format!("plumbing fixtures, area {index}")
        };
        handles.push(tokio::spawn(async move {
            let task_id = service.submit(SubmitRequest::new(query)).await.unwrap();
            (index, service.wait(task_id).await.unwrap())
        }));
    }

    for handle in handles {
        let (index, snapshot) = handle.await.unwrap();
        assert_eq!(snapshot.status, RunStatus::Completed);
        let expected = if index % 2 == 0 { "Drywall" } else { "Plumbing" };
        assert_eq!(trades(snapshot.result.as_ref().unwrap()), vec![expected]);
    }
    assert_eq!(service.active_tasks().await, 0);
}

#[tokio::test]
async fn test_subscriber_sees_only_its_task() {
    let llm = Arc::new(trade_aware_llm().with_delay(Duration::from_millis(2)));
    let broadcaster = Arc::new(ChannelBroadcaster::new(64));
    let service = TaskService::new(Arc::new(orchestrator(llm, broadcaster.clone())));

    // Subscribe before the run starts so no event is missed
    let mut all = broadcaster.subscribe();
    let first = service
        .submit(SubmitRequest::new("drywall takeoff"))
        .await
        .unwrap();
    let second = service
        .submit(SubmitRequest::new("plumbing takeoff"))
        .await
        .unwrap();

    let mut first_events = Vec::new();
    let mut terminals = 0;
    while terminals < 2 {
        let event = all.recv().await.unwrap();
        if event.is_terminal() {
            terminals += 1;
        }
        if event.task_id == first {
            first_events.push(event);
        } else {
            assert_eq!(event.task_id, second);
        }
    }

    assert_eq!(first_events.len(), 8);
    assert_eq!(
        first_events.last().and_then(|e| e.status),
        Some(RunStatus::Completed)
    );
}
