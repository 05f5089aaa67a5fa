//! Test helpers and utilities for integration tests

use std::sync::Arc;
use takeoff_agents::agents::Stage;
use takeoff_agents::config::PipelineConfig;
use takeoff_agents::llm::provider::{CompletionRequest, MessageRole};
use takeoff_agents::pipeline::Orchestrator;
use takeoff_agents::progress::ProgressBroadcaster;
use takeoff_agents::state::{FileKind, InputFile};
use takeoff_agents::store::InMemoryTaskStore;
use takeoff_agents::testing::{sample_pdf, MockLlmProvider};

/// Orchestrator over the test config and a fresh in-memory store
#[allow(dead_code)]
pub fn orchestrator(
    llm: Arc<MockLlmProvider>,
    progress: Arc<dyn ProgressBroadcaster>,
) -> Orchestrator {
    Orchestrator::new(
        &PipelineConfig::test_config(),
        llm,
        Arc::new(InMemoryTaskStore::new()),
        progress,
    )
    .expect("test config is valid")
}

/// A one-page architectural sheet
#[allow(dead_code)]
pub fn floor_plan_pdf() -> InputFile {
    InputFile::bytes(
        "A-101.pdf",
        FileKind::Pdf,
        sample_pdf("PARTITION TYPE P1: 5/8 TYPE X GYPSUM BOARD EACH SIDE, 3-5/8 STUDS"),
    )
}

fn user_text(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.to_lowercase())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Trade and scope id a request is about, judged from its prompt
fn subject(request: &CompletionRequest) -> (&'static str, &'static str) {
    let text = user_text(request);
    if text.contains("plumb") || text.contains("pl-1") {
        ("Plumbing", "PL-1")
    } else {
        ("Drywall", "DW-1")
    }
}

/// Mock whose replies follow whatever trade the prompt mentions, so two tasks
/// with different queries produce different results
#[allow(dead_code)]
pub fn trade_aware_llm() -> MockLlmProvider {
    MockLlmProvider::with_construction_defaults()
        .with_responder(Stage::TradeMapper, |request| {
            let (trade, _) = subject(request);
            format!(r#"[{{"trade":"{trade}","source":"query","rationale":"named in request"}}]"#)
        })
        .with_responder(Stage::Scope, |request| {
            let (trade, id) = subject(request);
            format!(r#"[{{"id":"{id}","trade":"{trade}","description":"{trade} work"}}]"#)
        })
        .with_responder(Stage::Takeoff, |request| {
            let (trade, id) = subject(request);
            let quantity = if trade == "Plumbing" { 14 } else { 1200 };
            format!(
                r#"[{{"scope_item_id":"{id}","description":"{trade} work","quantity":{quantity},"unit":"EA"}}]"#
            )
        })
        .with_responder(Stage::Estimator, |request| {
            let (_, id) = subject(request);
            format!(r#"[{{"scope_item_id":"{id}","unit_cost":3.0}}]"#)
        })
}
