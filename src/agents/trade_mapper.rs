//! TradeMapper: classifies document content into construction trades

use super::llm_helpers::{clip, parse_llm_json};
use super::{commit, prompts, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{SharedState, StateField, TradeAssignment};
use serde_json::json;
use std::collections::HashSet;
use std::fmt::Write;
use tracing::debug;

/// Characters of raw document text included per document
const EXCERPT_CHARS: usize = 4_000;

#[derive(Debug, Clone, Default)]
pub struct TradeMapperAgent;

impl TradeMapperAgent {
    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match map_trades(&state, ctx).await {
            Ok(output) => commit(state, Stage::TradeMapper, output, SharedState::set_trade_mapping),
            Err(error) => reject(state, error),
        }
    }
}

async fn map_trades(
    state: &SharedState,
    ctx: &StageContext,
) -> Result<StageOutput<Vec<TradeAssignment>>, StageError> {
    let documents = required(
        Stage::TradeMapper,
        StateField::ProcessedFileContent,
        state.processed_file_content(),
    )?;
    let query = state.query();

    if documents.is_empty() && query.is_none() {
        return Ok(StageOutput::warning(
            Vec::new(),
            "No documents or query to classify",
            json!({ "documents": 0 }),
        ));
    }

    let mut prompt = String::new();
    if let Some(query) = query {
        let _ = writeln!(prompt, "Estimator request: {query}\n");
    }
    for document in documents.values() {
        let _ = writeln!(
            prompt,
            "## {}\nSummary: {}\nSections: {}\nExcerpt:\n{}\n",
            document.file_name,
            document.summary,
            document.sections.join("; "),
            clip(&document.text, EXCERPT_CHARS)
        );
    }

    let reply = ctx
        .complete(Stage::TradeMapper, prompts::TRADE_MAPPER, prompt)
        .await?;
    let proposed: Vec<TradeAssignment> = parse_llm_json(Stage::TradeMapper, &reply)?;
    let trades = dedupe_trades(proposed)?;

    let detail = json!({
        "documents": documents.len(),
        "used_query": query.is_some(),
        "trades": trades.iter().map(|t| t.trade.as_str()).collect::<Vec<_>>(),
    });

    if trades.is_empty() {
        Ok(StageOutput::warning(trades, "No trades identified", detail))
    } else {
        let summary = format!("Identified {} trade(s)", trades.len());
        Ok(StageOutput::info(trades, summary, detail))
    }
}

/// Reject blank names and keep the first assignment per trade
fn dedupe_trades(proposed: Vec<TradeAssignment>) -> Result<Vec<TradeAssignment>, StageError> {
    let mut seen = HashSet::new();
    let mut trades = Vec::with_capacity(proposed.len());

    for mut assignment in proposed {
        let name = assignment.trade.trim().to_string();
        if name.is_empty() {
            return Err(StageError::validation(
                Stage::TradeMapper,
                "LLM returned a trade with no name",
            ));
        }
        if !seen.insert(name.to_lowercase()) {
            debug!(trade = %name, "Dropping repeated trade");
            continue;
        }
        assignment.trade = name;
        trades.push(assignment);
    }

    Ok(trades)
}
