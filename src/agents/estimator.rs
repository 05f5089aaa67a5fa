//! Estimator: prices takeoff lines
//!
//! The LLM only supplies unit costs. Line totals and the grand total are
//! computed here so the arithmetic is deterministic.

use super::llm_helpers::parse_llm_json;
use super::{commit, prompts, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{estimate_total, EstimateLine, SharedState, StateField, TakeoffItem};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::fmt::Write;

#[derive(Debug, Deserialize)]
struct UnitCost {
    scope_item_id: String,
    unit_cost: f64,
}

#[derive(Debug, Clone, Default)]
pub struct EstimatorAgent;

impl EstimatorAgent {
    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match price(&state, ctx).await {
            Ok(output) => commit(state, Stage::Estimator, output, SharedState::set_estimate),
            Err(error) => reject(state, error),
        }
    }
}

async fn price(
    state: &SharedState,
    ctx: &StageContext,
) -> Result<StageOutput<Vec<EstimateLine>>, StageError> {
    let takeoff = required(Stage::Estimator, StateField::TakeoffData, state.takeoff_data())?;
    if takeoff.is_empty() {
        return Ok(StageOutput::warning(
            Vec::new(),
            "No quantities to price",
            json!({ "lines": 0, "total": 0.0 }),
        ));
    }

    let mut prompt = String::from("Takeoff:\n");
    for item in takeoff {
        let _ = writeln!(
            prompt,
            "- {}: {} {} {}",
            item.scope_item_id, item.description, item.quantity, item.unit
        );
    }

    let reply = ctx
        .complete(Stage::Estimator, prompts::ESTIMATOR, prompt)
        .await?;
    let costs: Vec<UnitCost> = parse_llm_json(Stage::Estimator, &reply)?;
    let lines = price_lines(takeoff, &costs)?;

    let total = estimate_total(&lines);
    if !total.is_finite() {
        return Err(StageError::validation(
            Stage::Estimator,
            "estimate total is out of range",
        ));
    }
    let summary = format!("Priced {} line(s), total {:.2}", lines.len(), total);
    let detail = json!({ "lines": lines.len(), "total": total });
    Ok(StageOutput::info(lines, summary, detail))
}

fn price_lines(takeoff: &[TakeoffItem], costs: &[UnitCost]) -> Result<Vec<EstimateLine>, StageError> {
    let mut by_item: HashMap<&str, f64> = HashMap::new();
    for cost in costs {
        if !cost.unit_cost.is_finite() || cost.unit_cost < 0.0 {
            return Err(StageError::validation(
                Stage::Estimator,
                format!(
                    "invalid unit cost {} for scope item {}",
                    cost.unit_cost, cost.scope_item_id
                ),
            ));
        }
        by_item.insert(cost.scope_item_id.as_str(), cost.unit_cost);
    }

    takeoff
        .iter()
        .map(|item| {
            let unit_cost = by_item
                .get(item.scope_item_id.as_str())
                .copied()
                .ok_or_else(|| {
                    StageError::validation(
                        Stage::Estimator,
                        format!("no unit cost for scope item {}", item.scope_item_id),
                    )
                })?;
            let total = round_cents(item.quantity * unit_cost);
            if !total.is_finite() {
                return Err(StageError::validation(
                    Stage::Estimator,
                    format!(
                        "line total for scope item {} is out of range",
                        item.scope_item_id
                    ),
                ));
            }
            Ok(EstimateLine {
                scope_item_id: item.scope_item_id.clone(),
                description: item.description.clone(),
                quantity: item.quantity,
                unit: item.unit.clone(),
                unit_cost,
                total,
            })
        })
        .collect()
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
