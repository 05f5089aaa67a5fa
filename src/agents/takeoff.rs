//! Takeoff: measures a quantity for each scope item

use super::llm_helpers::parse_llm_json;
use super::{commit, prompts, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{ScopeItem, SharedState, StateField, TakeoffItem};
use serde_json::json;
use std::collections::HashSet;
use std::fmt::Write;

#[derive(Debug, Clone, Default)]
pub struct TakeoffAgent;

impl TakeoffAgent {
    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match measure(&state, ctx).await {
            Ok(output) => commit(state, Stage::Takeoff, output, SharedState::set_takeoff_data),
            Err(error) => reject(state, error),
        }
    }
}

async fn measure(
    state: &SharedState,
    ctx: &StageContext,
) -> Result<StageOutput<Vec<TakeoffItem>>, StageError> {
    let scope = required(Stage::Takeoff, StateField::ScopeItems, state.scope_items())?;
    if scope.is_empty() {
        return Ok(StageOutput::warning(
            Vec::new(),
            "No scope items to measure",
            json!({ "scope_items": 0 }),
        ));
    }

    let mut prompt = String::from("Scope items:\n");
    for item in scope {
        let _ = writeln!(prompt, "- {} [{}]: {}", item.id, item.trade, item.description);
    }

    let reply = ctx.complete(Stage::Takeoff, prompts::TAKEOFF, prompt).await?;
    let items: Vec<TakeoffItem> = parse_llm_json(Stage::Takeoff, &reply)?;
    check_takeoff_items(scope, &items)?;

    let measured: HashSet<&str> = items.iter().map(|i| i.scope_item_id.as_str()).collect();
    let unmeasured: Vec<&str> = scope
        .iter()
        .map(|s| s.id.as_str())
        .filter(|id| !measured.contains(id))
        .collect();
    let detail = json!({ "lines": items.len(), "unmeasured": unmeasured });

    if items.is_empty() {
        Ok(StageOutput::warning(items, "LLM returned no quantities", detail))
    } else {
        let summary = format!(
            "Measured {} line(s) for {} of {} scope item(s)",
            items.len(),
            measured.len(),
            scope.len()
        );
        Ok(StageOutput::info(items, summary, detail))
    }
}

fn check_takeoff_items(scope: &[ScopeItem], items: &[TakeoffItem]) -> Result<(), StageError> {
    let known: HashSet<&str> = scope.iter().map(|s| s.id.as_str()).collect();

    for item in items {
        if !known.contains(item.scope_item_id.as_str()) {
            return Err(StageError::validation(
                Stage::Takeoff,
                format!("takeoff references unknown scope item {}", item.scope_item_id),
            ));
        }
        if !item.quantity.is_finite() || item.quantity < 0.0 {
            return Err(StageError::validation(
                Stage::Takeoff,
                format!(
                    "invalid quantity {} for scope item {}",
                    item.quantity, item.scope_item_id
                ),
            ));
        }
        if item.unit.trim().is_empty() {
            return Err(StageError::validation(
                Stage::Takeoff,
                format!("missing unit for scope item {}", item.scope_item_id),
            ));
        }
    }
    Ok(())
}
