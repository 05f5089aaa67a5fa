//! Exporter: renders the finished estimate in the configured format

use super::{commit, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{
    estimate_total, EstimateLine, ExportDocument, ExportFormat, QaReport, ScopeItem, SharedState,
    StateField, TradeAssignment,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write;

/// JSON export payload; field names are part of the delivery contract
#[derive(Debug, Serialize)]
struct ExportPayload<'a> {
    generated_at: DateTime<Utc>,
    query: Option<&'a str>,
    trades: &'a [TradeAssignment],
    scope_items: &'a [ScopeItem],
    estimate: &'a [EstimateLine],
    estimate_total: f64,
    qa: Option<&'a QaReport>,
}

#[derive(Debug, Clone)]
pub struct ExporterAgent {
    format: ExportFormat,
}

impl ExporterAgent {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    /// Pure rendering; the context is unused because no LLM call is made
    pub async fn process(&self, state: SharedState, _ctx: &StageContext) -> SharedState {
        match self.render(&state) {
            Ok(output) => commit(state, Stage::Exporter, output, SharedState::set_export),
            Err(error) => reject(state, error),
        }
    }

    fn render(&self, state: &SharedState) -> Result<StageOutput<ExportDocument>, StageError> {
        let estimate = required(Stage::Exporter, StateField::Estimate, state.estimate())?;
        let payload = ExportPayload {
            generated_at: Utc::now(),
            query: state.query(),
            trades: state.trade_mapping().unwrap_or_default(),
            scope_items: state.scope_items().unwrap_or_default(),
            estimate,
            estimate_total: estimate_total(estimate),
            qa: state.qa_report(),
        };

        let content = match self.format {
            ExportFormat::Json => serde_json::to_string_pretty(&payload).map_err(|e| {
                StageError::validation(Stage::Exporter, format!("cannot serialize export: {e}"))
            })?,
            ExportFormat::Markdown => render_markdown(&payload),
        };

        let detail = json!({
            "format": self.format,
            "bytes": content.len(),
            "lines": estimate.len(),
        });
        let document = ExportDocument {
            format: self.format,
            content,
            generated_at: payload.generated_at,
        };

        if estimate.is_empty() {
            Ok(StageOutput::warning(
                document,
                "Exported an empty estimate",
                detail,
            ))
        } else {
            let summary = format!(
                "Exported {} estimate line(s) as {:?}",
                estimate.len(),
                self.format
            );
            Ok(StageOutput::info(document, summary, detail))
        }
    }
}

fn render_markdown(payload: &ExportPayload<'_>) -> String {
    let mut out = String::from("# Construction Estimate\n\n");
    let _ = writeln!(out, "Generated: {}", payload.generated_at.to_rfc3339());
    if let Some(query) = payload.query {
        let _ = writeln!(out, "Request: {query}");
    }

    if !payload.trades.is_empty() {
        out.push_str("\n## Trades\n\n");
        for trade in payload.trades {
            let division = trade.csi_division.as_deref().unwrap_or("-");
            let _ = writeln!(out, "- {} ({division})", trade.trade);
        }
    }

    out.push_str("\n## Estimate\n\n");
    out.push_str("| Item | Description | Qty | Unit | Unit cost | Total |\n");
    out.push_str("|---|---|---:|---|---:|---:|\n");
    for line in payload.estimate {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {:.2} | {:.2} |",
            line.scope_item_id,
            line.description.replace('|', "/"),
            line.quantity,
            line.unit,
            line.unit_cost,
            line.total
        );
    }
    let _ = writeln!(out, "\n**Total: {:.2}**", payload.estimate_total);

    if let Some(qa) = payload.qa {
        let _ = writeln!(
            out,
            "\n## QA\n\nConfidence {:.2} (threshold {:.2})",
            qa.confidence, qa.threshold
        );
        for issue in &qa.issues {
            let _ = writeln!(out, "- {}", issue.message);
        }
    }

    out
}
