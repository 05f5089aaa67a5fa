//! QAValidator: cross-checks scope, takeoff and estimate before export
//!
//! Deterministic consistency checks run first, then the LLM reviews the whole
//! estimate and rates its confidence. Issues are reported in the stage's trace
//! entry; the run is blocked only when confidence falls below the threshold.

use super::llm_helpers::parse_llm_json;
use super::{commit, prompts, reject, required, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{EstimateLine, QaIssue, QaReport, ScopeItem, SharedState, StateField, TakeoffItem};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::fmt::Write;

#[derive(Debug, Deserialize)]
struct Review {
    confidence: f64,
    #[serde(default)]
    issues: Vec<QaIssue>,
}

#[derive(Debug, Clone)]
pub struct QaValidatorAgent {
    confidence_threshold: f64,
}

impl QaValidatorAgent {
    pub fn new(confidence_threshold: f64) -> Self {
        Self {
            confidence_threshold,
        }
    }

    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match self.review(&state, ctx).await {
            Ok(output) => commit(state, Stage::QaValidator, output, SharedState::set_qa_report),
            Err(error) => reject(state, error),
        }
    }

    async fn review(
        &self,
        state: &SharedState,
        ctx: &StageContext,
    ) -> Result<StageOutput<QaReport>, StageError> {
        let scope = required(Stage::QaValidator, StateField::ScopeItems, state.scope_items())?;
        let takeoff = required(
            Stage::QaValidator,
            StateField::TakeoffData,
            state.takeoff_data(),
        )?;
        let estimate = required(Stage::QaValidator, StateField::Estimate, state.estimate())?;

        let mut issues = consistency_issues(scope, takeoff, estimate);

        // Nothing priced: pass only if nothing upstream went missing either
        let confidence = if estimate.is_empty() {
            if issues.is_empty() {
                1.0
            } else {
                0.0
            }
        } else {
            let review = self.ask_reviewer(ctx, scope, takeoff, estimate).await?;
            issues.extend(review.issues);
            review.confidence
        };

        let report = QaReport {
            confidence,
            threshold: self.confidence_threshold,
            issues,
        };

        if !report.passed() {
            return Err(StageError::validation(
                Stage::QaValidator,
                format!(
                    "QA confidence {:.2} is below threshold {:.2} ({} issue(s))",
                    report.confidence,
                    report.threshold,
                    report.issues.len()
                ),
            ));
        }

        let detail = json!({
            "confidence": report.confidence,
            "threshold": report.threshold,
            "issues": report.issues,
        });
        if estimate.is_empty() {
            Ok(StageOutput::warning(report, "Nothing priced to review", detail))
        } else if report.issues.is_empty() {
            let summary = format!("Estimate passed QA at confidence {:.2}", report.confidence);
            Ok(StageOutput::info(report, summary, detail))
        } else {
            let summary = format!(
                "Estimate passed QA at confidence {:.2} with {} warning(s)",
                report.confidence,
                report.issues.len()
            );
            Ok(StageOutput::warning(report, summary, detail))
        }
    }

    async fn ask_reviewer(
        &self,
        ctx: &StageContext,
        scope: &[ScopeItem],
        takeoff: &[TakeoffItem],
        estimate: &[EstimateLine],
    ) -> Result<Review, StageError> {
        let mut prompt = String::from("Scope items:\n");
        for item in scope {
            let _ = writeln!(prompt, "- {} [{}]: {}", item.id, item.trade, item.description);
        }
        prompt.push_str("\nTakeoff:\n");
        for item in takeoff {
            let _ = writeln!(
                prompt,
                "- {}: {} {}",
                item.scope_item_id, item.quantity, item.unit
            );
        }
        prompt.push_str("\nEstimate:\n");
        for line in estimate {
            let _ = writeln!(
                prompt,
                "- {}: {} {} x {:.2} = {:.2}",
                line.scope_item_id, line.quantity, line.unit, line.unit_cost, line.total
            );
        }

        let reply = ctx
            .complete(Stage::QaValidator, prompts::QA_VALIDATOR, prompt)
            .await?;
        let review: Review = parse_llm_json(Stage::QaValidator, &reply)?;

        if !(0.0..=1.0).contains(&review.confidence) {
            return Err(StageError::validation(
                Stage::QaValidator,
                format!("reviewer confidence {} is outside 0..1", review.confidence),
            ));
        }
        Ok(review)
    }
}

/// Gaps between the three upstream lists
fn consistency_issues(
    scope: &[ScopeItem],
    takeoff: &[TakeoffItem],
    estimate: &[EstimateLine],
) -> Vec<QaIssue> {
    let measured: HashSet<&str> = takeoff.iter().map(|t| t.scope_item_id.as_str()).collect();
    let priced: HashSet<&str> = estimate.iter().map(|e| e.scope_item_id.as_str()).collect();
    let mut issues = Vec::new();

    for item in scope {
        if !measured.contains(item.id.as_str()) {
            issues.push(QaIssue {
                message: format!("scope item {} has no takeoff quantity", item.id),
                scope_item_id: Some(item.id.clone()),
            });
        }
    }
    for item in takeoff {
        if !priced.contains(item.scope_item_id.as_str()) {
            issues.push(QaIssue {
                message: format!("takeoff for {} has no estimate line", item.scope_item_id),
                scope_item_id: Some(item.scope_item_id.clone()),
            });
        }
    }
    for line in estimate {
        if line.total <= 0.0 {
            issues.push(QaIssue {
                message: format!("estimate line {} totals {:.2}", line.scope_item_id, line.total),
                scope_item_id: Some(line.scope_item_id.clone()),
            });
        }
    }

    issues
}
