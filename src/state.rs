//! Shared state record threaded through one pipeline run
//!
//! One [`SharedState`] exists per task. It is moved into each agent and handed
//! back when the agent finishes, so no stage holds a reference to it after
//! returning. Every stage-owned field starts as `None` ("unset"); the owning
//! stage is the only code path that populates it, and a populated field is
//! never overwritten.

use crate::error::StageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Identifier of one orchestration run
pub type TaskId = Uuid;

/// Declared type of an uploaded document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Text,
    Markdown,
    Csv,
    Json,
    Image,
    Other,
}

impl FileKind {
    /// Guess the kind from a file name extension
    pub fn from_name(name: &str) -> Self {
        let extension = Path::new(name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());

        match extension.as_deref() {
            Some("pdf") => FileKind::Pdf,
            Some("txt") | Some("text") => FileKind::Text,
            Some("md") | Some("markdown") => FileKind::Markdown,
            Some("csv") => FileKind::Csv,
            Some("json") => FileKind::Json,
            Some("png") | Some("jpg") | Some("jpeg") | Some("tif") | Some("tiff") => {
                FileKind::Image
            }
            _ => FileKind::Other,
        }
    }

    /// Whether the content is expected to be UTF-8 text
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FileKind::Text | FileKind::Markdown | FileKind::Csv | FileKind::Json
        )
    }
}

/// Where the bytes of an input file come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileSource {
    Text(String),
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// A caller-supplied document reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    pub name: String,
    pub kind: FileKind,
    pub source: FileSource,
}

impl InputFile {
    pub fn text(name: impl Into<String>, content: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: FileKind::from_name(&name),
            name,
            source: FileSource::Text(content.into()),
        }
    }

    pub fn bytes(name: impl Into<String>, kind: FileKind, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            source: FileSource::Bytes(content),
        }
    }

    /// Reference a file on disk; name and kind come from the path
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            kind: FileKind::from_name(&name),
            name,
            source: FileSource::Path(path),
        }
    }
}

/// Text and structure FileReader extracted from one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedDocument {
    pub file_name: String,
    pub kind: FileKind,
    pub text: String,
    pub summary: String,
    #[serde(default)]
    pub sections: Vec<String>,
}

/// One construction trade identified in the documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeAssignment {
    pub trade: String,
    #[serde(default)]
    pub csi_division: Option<String>,
    /// Document (or "query") the trade was found in
    pub source: String,
    #[serde(default)]
    pub rationale: String,
}

/// A unit of work in the scope of a trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeItem {
    pub id: String,
    pub trade: String,
    pub description: String,
    #[serde(default)]
    pub source: Option<String>,
}

/// Measured quantity for a scope item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TakeoffItem {
    pub scope_item_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
}

/// Priced takeoff line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateLine {
    pub scope_item_id: String,
    pub description: String,
    pub quantity: f64,
    pub unit: String,
    pub unit_cost: f64,
    pub total: f64,
}

/// Sum of all line totals
pub fn estimate_total(lines: &[EstimateLine]) -> f64 {
    lines.iter().map(|l| l.total).sum()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaIssue {
    pub message: String,
    #[serde(default)]
    pub scope_item_id: Option<String>,
}

/// Outcome of the QA cross-check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaReport {
    pub confidence: f64,
    pub threshold: f64,
    pub issues: Vec<QaIssue>,
}

impl QaReport {
    pub fn passed(&self) -> bool {
        self.confidence >= self.threshold
    }
}

/// Delivery formats the Exporter can produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub format: ExportFormat,
    pub content: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Info,
    Warning,
    Error,
}

/// One audit record appended by a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub agent_name: String,
    pub decision_summary: String,
    pub detail: Value,
    pub timestamp: DateTime<Utc>,
    pub level: TraceLevel,
}

impl TraceEntry {
    pub fn new(
        agent_name: impl Into<String>,
        level: TraceLevel,
        decision_summary: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            decision_summary: decision_summary.into(),
            detail,
            timestamp: Utc::now(),
            level,
        }
    }
}

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-owned fields of the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    ProcessedFileContent,
    TradeMapping,
    ScopeItems,
    TakeoffData,
    Estimate,
    QaReport,
    Export,
}

impl StateField {
    pub fn name(&self) -> &'static str {
        match self {
            StateField::ProcessedFileContent => "processed_file_content",
            StateField::TradeMapping => "trade_mapping",
            StateField::ScopeItems => "scope_items",
            StateField::TakeoffData => "takeoff_data",
            StateField::Estimate => "estimate",
            StateField::QaReport => "qa_report",
            StateField::Export => "export",
        }
    }
}

impl fmt::Display for StateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("field {0} is already populated")]
    AlreadyPopulated(StateField),
}

/// Caller-provided upstream data for subset runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub processed_file_content: Option<BTreeMap<String, ProcessedDocument>>,
    pub trade_mapping: Option<Vec<TradeAssignment>>,
    pub scope_items: Option<Vec<ScopeItem>>,
    pub takeoff_data: Option<Vec<TakeoffItem>>,
    pub estimate: Option<Vec<EstimateLine>>,
}

impl SeedData {
    pub fn is_empty(&self) -> bool {
        self.processed_file_content.is_none()
            && self.trade_mapping.is_none()
            && self.scope_items.is_none()
            && self.takeoff_data.is_none()
            && self.estimate.is_none()
    }
}

/// Result document handed to the task store; field names are part of the
/// client contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub trade_mapping: Option<Vec<TradeAssignment>>,
    pub scope_items: Option<Vec<ScopeItem>>,
    pub takeoff_data: Option<Vec<TakeoffItem>>,
    pub estimate: Option<Vec<EstimateLine>>,
    pub estimate_total: Option<f64>,
    pub qa_report: Option<QaReport>,
    pub export: Option<ExportDocument>,
    pub agent_trace: Vec<TraceEntry>,
}

/// What a finished run reports: the result document (partial on failure)
/// and the error that halted it, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub result: TaskResult,
    pub error: Option<StageError>,
}

#[derive(Debug, Clone)]
pub struct SharedState {
    query: Option<String>,
    input_files: Vec<InputFile>,
    processed_file_content: Option<BTreeMap<String, ProcessedDocument>>,
    trade_mapping: Option<Vec<TradeAssignment>>,
    scope_items: Option<Vec<ScopeItem>>,
    takeoff_data: Option<Vec<TakeoffItem>>,
    estimate: Option<Vec<EstimateLine>>,
    qa_report: Option<QaReport>,
    export: Option<ExportDocument>,
    agent_trace: Vec<TraceEntry>,
    status: RunStatus,
    error: Option<StageError>,
}

macro_rules! owned_field_setter {
    ($setter:ident, $field:ident, $variant:ident, $ty:ty) => {
        pub fn $setter(&mut self, value: $ty) -> Result<(), StateError> {
            if self.$field.is_some() {
                return Err(StateError::AlreadyPopulated(StateField::$variant));
            }
            self.$field = Some(value);
            Ok(())
        }
    };
}

impl SharedState {
    pub fn new(query: Option<String>, input_files: Vec<InputFile>) -> Self {
        Self {
            query: query.filter(|q| !q.trim().is_empty()),
            input_files,
            processed_file_content: None,
            trade_mapping: None,
            scope_items: None,
            takeoff_data: None,
            estimate: None,
            qa_report: None,
            export: None,
            agent_trace: Vec::new(),
            status: RunStatus::Pending,
            error: None,
        }
    }

    /// Pre-populate upstream fields for a subset run
    pub fn with_seed(mut self, seed: SeedData) -> Self {
        self.processed_file_content = seed.processed_file_content;
        self.trade_mapping = seed.trade_mapping;
        self.scope_items = seed.scope_items;
        self.takeoff_data = seed.takeoff_data;
        self.estimate = seed.estimate;
        self
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn input_files(&self) -> &[InputFile] {
        &self.input_files
    }

    pub fn processed_file_content(&self) -> Option<&BTreeMap<String, ProcessedDocument>> {
        self.processed_file_content.as_ref()
    }

    pub fn trade_mapping(&self) -> Option<&[TradeAssignment]> {
        self.trade_mapping.as_deref()
    }

    pub fn scope_items(&self) -> Option<&[ScopeItem]> {
        self.scope_items.as_deref()
    }

    pub fn takeoff_data(&self) -> Option<&[TakeoffItem]> {
        self.takeoff_data.as_deref()
    }

    pub fn estimate(&self) -> Option<&[EstimateLine]> {
        self.estimate.as_deref()
    }

    pub fn qa_report(&self) -> Option<&QaReport> {
        self.qa_report.as_ref()
    }

    pub fn export(&self) -> Option<&ExportDocument> {
        self.export.as_ref()
    }

    pub fn agent_trace(&self) -> &[TraceEntry] {
        &self.agent_trace
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn error(&self) -> Option<&StageError> {
        self.error.as_ref()
    }

    /// Whether a stage-owned field has been populated (by a stage or a seed)
    pub fn has(&self, field: StateField) -> bool {
        match field {
            StateField::ProcessedFileContent => self.processed_file_content.is_some(),
            StateField::TradeMapping => self.trade_mapping.is_some(),
            StateField::ScopeItems => self.scope_items.is_some(),
            StateField::TakeoffData => self.takeoff_data.is_some(),
            StateField::Estimate => self.estimate.is_some(),
            StateField::QaReport => self.qa_report.is_some(),
            StateField::Export => self.export.is_some(),
        }
    }

    owned_field_setter!(
        set_processed_file_content,
        processed_file_content,
        ProcessedFileContent,
        BTreeMap<String, ProcessedDocument>
    );
    owned_field_setter!(set_trade_mapping, trade_mapping, TradeMapping, Vec<TradeAssignment>);
    owned_field_setter!(set_scope_items, scope_items, ScopeItems, Vec<ScopeItem>);
    owned_field_setter!(set_takeoff_data, takeoff_data, TakeoffData, Vec<TakeoffItem>);
    owned_field_setter!(set_estimate, estimate, Estimate, Vec<EstimateLine>);
    owned_field_setter!(set_qa_report, qa_report, QaReport, QaReport);
    owned_field_setter!(set_export, export, Export, ExportDocument);

    pub fn push_trace(&mut self, entry: TraceEntry) {
        self.agent_trace.push(entry);
    }

    /// Record a failure. Only the first failure is kept; returns whether this
    /// call set the error.
    pub fn fail(&mut self, error: StageError) -> bool {
        self.status = RunStatus::Failed;
        if self.error.is_some() {
            warn!(ignored = %error, "Task already failed, keeping first error");
            return false;
        }
        self.error = Some(error);
        true
    }

    pub fn mark_in_progress(&mut self) {
        self.advance(RunStatus::InProgress);
    }

    pub fn mark_completed(&mut self) {
        self.advance(RunStatus::Completed);
    }

    fn advance(&mut self, next: RunStatus) {
        let allowed = matches!(
            (self.status, next),
            (RunStatus::Pending, RunStatus::InProgress)
                | (RunStatus::InProgress, RunStatus::Completed)
        );
        if allowed {
            self.status = next;
        } else {
            warn!(from = %self.status, to = %next, "Ignoring illegal status transition");
        }
    }

    /// Snapshot of the output fields and trace
    pub fn result(&self) -> TaskResult {
        TaskResult {
            trade_mapping: self.trade_mapping.clone(),
            scope_items: self.scope_items.clone(),
            takeoff_data: self.takeoff_data.clone(),
            estimate: self.estimate.clone(),
            estimate_total: self.estimate.as_deref().map(estimate_total),
            qa_report: self.qa_report.clone(),
            export: self.export.clone(),
            agent_trace: self.agent_trace.clone(),
        }
    }

    pub fn outcome(&self) -> TaskOutcome {
        TaskOutcome {
            result: self.result(),
            error: self.error.clone(),
        }
    }

    pub fn into_result(self) -> TaskResult {
        let estimate_total = self.estimate.as_deref().map(estimate_total);
        TaskResult {
            trade_mapping: self.trade_mapping,
            scope_items: self.scope_items,
            takeoff_data: self.takeoff_data,
            estimate: self.estimate,
            estimate_total,
            qa_report: self.qa_report,
            export: self.export,
            agent_trace: self.agent_trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::Stage;
    use serde_json::json;

    #[test]
    fn test_new_state_is_pending_and_unset() {
        let state = SharedState::new(Some("drywall takeoff".into()), vec![]);

        assert_eq!(state.status(), RunStatus::Pending);
        assert_eq!(state.query(), Some("drywall takeoff"));
        assert!(state.processed_file_content().is_none());
        assert!(state.estimate().is_none());
        assert!(state.agent_trace().is_empty());
        assert!(state.error().is_none());
    }

    #[test]
    fn test_blank_query_is_dropped() {
        let state = SharedState::new(Some("   ".into()), vec![]);
        assert!(state.query().is_none());
    }

    #[test]
    fn test_owned_field_written_once() {
        let mut state = SharedState::new(None, vec![]);
        state.set_scope_items(vec![]).unwrap();

        let second = state.set_scope_items(vec![ScopeItem {
            id: "S1".into(),
            trade: "Drywall".into(),
            description: "Hang board".into(),
            source: None,
        }]);

        assert_eq!(
            second,
            Err(StateError::AlreadyPopulated(StateField::ScopeItems))
        );
        assert_eq!(state.scope_items().map(|s| s.len()), Some(0));
    }

    #[test]
    fn test_fail_keeps_first_error_and_forces_failed() {
        let mut state = SharedState::new(None, vec![]);
        state.mark_in_progress();

        assert!(state.fail(StageError::validation(Stage::Scope, "first")));
        assert!(!state.fail(StageError::validation(Stage::Takeoff, "second")));

        assert_eq!(state.status(), RunStatus::Failed);
        assert_eq!(state.error().map(|e| e.message.as_str()), Some("first"));
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut state = SharedState::new(None, vec![]);
        state.mark_completed();
        assert_eq!(state.status(), RunStatus::Pending);

        state.mark_in_progress();
        state.mark_completed();
        assert_eq!(state.status(), RunStatus::Completed);

        state.mark_in_progress();
        assert_eq!(state.status(), RunStatus::Completed);
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut state = SharedState::new(None, vec![]);
        state.fail(StageError::cancelled(None));
        state.mark_in_progress();
        state.mark_completed();
        assert_eq!(state.status(), RunStatus::Failed);
    }

    #[test]
    fn test_seed_marks_fields_present() {
        let seed = SeedData {
            scope_items: Some(vec![]),
            ..SeedData::default()
        };
        let state = SharedState::new(None, vec![]).with_seed(seed);

        assert!(state.has(StateField::ScopeItems));
        assert!(!state.has(StateField::TakeoffData));
    }

    #[test]
    fn test_trace_is_append_only_in_order() {
        let mut state = SharedState::new(None, vec![]);
        state.push_trace(TraceEntry::new("FileReader", TraceLevel::Info, "a", json!({})));
        state.push_trace(TraceEntry::new("TradeMapper", TraceLevel::Info, "b", json!({})));

        let names: Vec<_> = state
            .agent_trace()
            .iter()
            .map(|e| e.agent_name.as_str())
            .collect();
        assert_eq!(names, vec!["FileReader", "TradeMapper"]);
    }

    #[test]
    fn test_result_includes_total() {
        let mut state = SharedState::new(None, vec![]);
        state
            .set_estimate(vec![
                EstimateLine {
                    scope_item_id: "S1".into(),
                    description: "Board".into(),
                    quantity: 10.0,
                    unit: "SF".into(),
                    unit_cost: 2.0,
                    total: 20.0,
                },
                EstimateLine {
                    scope_item_id: "S2".into(),
                    description: "Tape".into(),
                    quantity: 5.0,
                    unit: "LF".into(),
                    unit_cost: 1.5,
                    total: 7.5,
                },
            ])
            .unwrap();

        let result = state.into_result();
        assert_eq!(result.estimate_total, Some(27.5));
        assert!(result.trade_mapping.is_none());
    }

    #[test]
    fn test_file_kind_from_name() {
        assert_eq!(FileKind::from_name("A-101 Plans.PDF"), FileKind::Pdf);
        assert_eq!(FileKind::from_name("specs.md"), FileKind::Markdown);
        assert_eq!(FileKind::from_name("schedule.csv"), FileKind::Csv);
        assert_eq!(FileKind::from_name("photo.jpeg"), FileKind::Image);
        assert_eq!(FileKind::from_name("README"), FileKind::Other);
        assert!(FileKind::Csv.is_textual());
        assert!(!FileKind::Pdf.is_textual());
    }

    #[test]
    fn test_input_file_from_path() {
        let file = InputFile::from_path("/tmp/drawings/A-201.pdf");
        assert_eq!(file.name, "A-201.pdf");
        assert_eq!(file.kind, FileKind::Pdf);
    }

    #[test]
    fn test_file_source_serialization() {
        let file = InputFile::text("notes.txt", "Level 2 partitions");
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["source"]["text"], "Level 2 partitions");
        assert_eq!(json["kind"], "text");
    }
}
