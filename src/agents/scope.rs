//! Scope: breaks each identified trade into priceable scope items

use super::llm_helpers::parse_llm_json;
use super::{commit, prompts, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{ScopeItem, SharedState, StateField, TradeAssignment};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

#[derive(Debug, Clone, Default)]
pub struct ScopeAgent;

impl ScopeAgent {
    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match define_scope(&state, ctx).await {
            Ok(output) => commit(state, Stage::Scope, output, SharedState::set_scope_items),
            Err(error) => reject(state, error),
        }
    }
}

async fn define_scope(
    state: &SharedState,
    ctx: &StageContext,
) -> Result<StageOutput<Vec<ScopeItem>>, StageError> {
    let trades = required(Stage::Scope, StateField::TradeMapping, state.trade_mapping())?;
    if trades.is_empty() {
        return Ok(StageOutput::warning(
            Vec::new(),
            "No trades to scope",
            json!({ "trades": 0 }),
        ));
    }

    let mut prompt = String::from("Trades:\n");
    for trade in trades {
        let _ = writeln!(
            prompt,
            "- {} (division {}, from {}): {}",
            trade.trade,
            trade.csi_division.as_deref().unwrap_or("unknown"),
            trade.source,
            trade.rationale
        );
    }
    if let Some(documents) = state.processed_file_content() {
        prompt.push_str("\nDocuments:\n");
        for document in documents.values() {
            let _ = writeln!(prompt, "- {}: {}", document.file_name, document.summary);
        }
    }

    let reply = ctx.complete(Stage::Scope, prompts::SCOPE, prompt).await?;
    let items: Vec<ScopeItem> = parse_llm_json(Stage::Scope, &reply)?;
    let items = check_scope_items(trades, items)?;

    let mut per_trade: BTreeMap<&str, usize> = BTreeMap::new();
    for item in &items {
        *per_trade.entry(item.trade.as_str()).or_default() += 1;
    }
    let detail = json!({ "items": items.len(), "per_trade": per_trade });

    if items.is_empty() {
        Ok(StageOutput::warning(items, "LLM returned no scope items", detail))
    } else {
        let summary = format!(
            "Defined {} scope item(s) across {} trade(s)",
            items.len(),
            per_trade.len()
        );
        Ok(StageOutput::info(items, summary, detail))
    }
}

/// Every item needs a unique id and must name a trade from the mapping.
/// Trade names are normalized to the mapping's spelling.
fn check_scope_items(
    trades: &[TradeAssignment],
    items: Vec<ScopeItem>,
) -> Result<Vec<ScopeItem>, StageError> {
    let known: BTreeMap<String, &str> = trades
        .iter()
        .map(|t| (t.trade.to_lowercase(), t.trade.as_str()))
        .collect();
    let mut ids = HashSet::new();

    items
        .into_iter()
        .map(|mut item| {
            item.id = item.id.trim().to_string();
            if item.id.is_empty() {
                return Err(StageError::validation(Stage::Scope, "scope item without an id"));
            }
            if !ids.insert(item.id.clone()) {
                return Err(StageError::validation(
                    Stage::Scope,
                    format!("duplicate scope item id {}", item.id),
                ));
            }
            let canonical = known
                .get(&item.trade.trim().to_lowercase())
                .ok_or_else(|| {
                    StageError::validation(
                        Stage::Scope,
                        format!("scope item {} references unknown trade {}", item.id, item.trade),
                    )
                })?;
            item.trade = canonical.to_string();
            Ok(item)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SeedData, TraceLevel};
    use crate::testing::mocks::{test_context, MockLlmProvider};
    use std::sync::Arc;

    fn drywall() -> TradeAssignment {
        TradeAssignment {
            trade: "Drywall".into(),
            csi_division: Some("09 21 16".into()),
            source: "A-101.pdf".into(),
            rationale: "Partition types".into(),
        }
    }

    fn with_trades(trades: Vec<TradeAssignment>) -> SharedState {
        SharedState::new(None, vec![]).with_seed(SeedData {
            trade_mapping: Some(trades),
            ..SeedData::default()
        })
    }

    #[tokio::test]
    async fn test_scope_items_normalized_to_known_trades() {
        let llm = Arc::new(MockLlmProvider::new().with_reply(
            Stage::Scope,
            r#"[{"id":"DW-1","trade":"drywall","description":"Hang 5/8 type X board","source":"A-101.pdf"}]"#,
        ));

        let state = ScopeAgent
            .process(with_trades(vec![drywall()]), &test_context(llm))
            .await;

        let items = state.scope_items().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].trade, "Drywall");
        assert_eq!(state.agent_trace()[0].level, TraceLevel::Info);
    }

    #[tokio::test]
    async fn test_unknown_trade_is_validation_error() {
        let llm = Arc::new(MockLlmProvider::new().with_reply(
            Stage::Scope,
            r#"[{"id":"EL-1","trade":"Electrical","description":"Pull wire"}]"#,
        ));

        let state = ScopeAgent
            .process(with_trades(vec![drywall()]), &test_context(llm))
            .await;

        assert!(state
            .error()
            .unwrap()
            .message
            .contains("references unknown trade Electrical"));
        assert!(state.scope_items().is_none());
    }

    #[tokio::test]
    async fn test_empty_trades_skip_llm() {
        let llm = Arc::new(MockLlmProvider::new());

        let state = ScopeAgent
            .process(with_trades(vec![]), &test_context(llm.clone()))
            .await;

        assert_eq!(state.scope_items().map(|s| s.len()), Some(0));
        assert_eq!(llm.total_calls().await, 0);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let item = ScopeItem {
            id: "DW-1".into(),
            trade: "Drywall".into(),
            description: "Board".into(),
            source: None,
        };
        let err = check_scope_items(&[drywall()], vec![item.clone(), item]).unwrap_err();
        assert!(err.message.contains("duplicate scope item id DW-1"));
    }
}
