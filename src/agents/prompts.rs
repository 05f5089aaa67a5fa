//! System prompts bundled at compile time, one per LLM-backed stage

use crate::agents::Stage;

/// FileReader - summarizes one extracted document
pub const FILE_READER: &str = include_str!("prompts/file_reader.md");

/// TradeMapper - classifies documents into construction trades
pub const TRADE_MAPPER: &str = include_str!("prompts/trade_mapper.md");

/// Scope - breaks trades into priceable scope items
pub const SCOPE: &str = include_str!("prompts/scope.md");

/// Takeoff - measures quantities per scope item
pub const TAKEOFF: &str = include_str!("prompts/takeoff.md");

/// Estimator - supplies unit costs
pub const ESTIMATOR: &str = include_str!("prompts/estimator.md");

/// QAValidator - reviews the estimate and rates confidence
pub const QA_VALIDATOR: &str = include_str!("prompts/qa_validator.md");

/// System prompt for a stage; the Exporter never calls the LLM
pub fn system_prompt(stage: Stage) -> Option<&'static str> {
    match stage {
        Stage::FileReader => Some(FILE_READER),
        Stage::TradeMapper => Some(TRADE_MAPPER),
        Stage::Scope => Some(SCOPE),
        Stage::Takeoff => Some(TAKEOFF),
        Stage::Estimator => Some(ESTIMATOR),
        Stage::QaValidator => Some(QA_VALIDATOR),
        Stage::Exporter => None,
    }
}
