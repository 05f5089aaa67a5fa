//! FileReader: turns uploaded documents into text plus a short structure

use super::llm_helpers::{clip, parse_llm_json};
use super::{commit, prompts, reject, Stage, StageContext, StageOutput};
use crate::error::StageError;
use crate::state::{FileKind, FileSource, InputFile, ProcessedDocument, SharedState};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::debug;

/// Shortest run of printable bytes kept when scraping binary documents
const MIN_PRINTABLE_RUN: usize = 4;

/// Characters of extracted text sent to the LLM per document
const MAX_PROMPT_CHARS: usize = 24_000;

/// Literal string shown by a `Tj`, or each string inside a `TJ` array
static PDF_SHOW_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\(((?:\\.|[^\\)])*)\)\s*Tj|\[((?:\\.|[^\]])*)\]\s*TJ")
        .expect("pdf text pattern is valid")
});

static PDF_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(((?:\\.|[^\\)])*)\)").expect("pdf literal pattern is valid"));

#[derive(Debug, Deserialize)]
struct DocumentStructure {
    summary: String,
    #[serde(default)]
    sections: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FileReaderAgent {
    max_file_bytes: u64,
}

impl FileReaderAgent {
    pub fn new(max_file_bytes: u64) -> Self {
        Self { max_file_bytes }
    }

    pub async fn process(&self, state: SharedState, ctx: &StageContext) -> SharedState {
        match self.read_all(&state, ctx).await {
            Ok(output) => commit(
                state,
                Stage::FileReader,
                output,
                SharedState::set_processed_file_content,
            ),
            Err(error) => reject(state, error),
        }
    }

    async fn read_all(
        &self,
        state: &SharedState,
        ctx: &StageContext,
    ) -> Result<StageOutput<BTreeMap<String, ProcessedDocument>>, StageError> {
        let files = state.input_files();
        if files.is_empty() {
            return Ok(StageOutput::warning(
                BTreeMap::new(),
                "No input files supplied; nothing to read",
                json!({ "files": 0 }),
            ));
        }

        let mut documents = BTreeMap::new();
        let mut characters = 0usize;

        for file in files {
            if documents.contains_key(&file.name) {
                return Err(StageError::validation(
                    Stage::FileReader,
                    format!("duplicate file name {}", file.name),
                ));
            }

            let bytes = self.load(file).await?;
            let text = extract_text(file.kind, &bytes).ok_or_else(|| {
                StageError::validation(
                    Stage::FileReader,
                    format!("unreadable file {}: no extractable text", file.name),
                )
            })?;
            debug!(file = %file.name, kind = ?file.kind, chars = text.len(), "Extracted text");

            let prompt = format!(
                "Document: {} ({:?})\n\n{}",
                file.name,
                file.kind,
                clip(&text, MAX_PROMPT_CHARS)
            );
            let reply = ctx
                .complete(Stage::FileReader, prompts::FILE_READER, prompt)
                .await?;
            let structure: DocumentStructure = parse_llm_json(Stage::FileReader, &reply)?;

            characters += text.chars().count();
            documents.insert(
                file.name.clone(),
                ProcessedDocument {
                    file_name: file.name.clone(),
                    kind: file.kind,
                    text,
                    summary: structure.summary,
                    sections: structure.sections,
                },
            );
        }

        let summary = format!("Read {} document(s)", documents.len());
        let detail = json!({
            "files": documents.keys().collect::<Vec<_>>(),
            "characters": characters,
        });
        Ok(StageOutput::info(documents, summary, detail))
    }

    async fn load<'a>(&self, file: &'a InputFile) -> Result<Cow<'a, [u8]>, StageError> {
        let bytes: Cow<'a, [u8]> = match &file.source {
            FileSource::Text(text) => Cow::Borrowed(text.as_bytes()),
            FileSource::Bytes(bytes) => Cow::Borrowed(bytes.as_slice()),
            FileSource::Path(path) => {
                let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                    StageError::validation(
                        Stage::FileReader,
                        format!("cannot open {}: {e}", file.name),
                    )
                })?;
                self.check_size(file, metadata.len())?;
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    StageError::validation(
                        Stage::FileReader,
                        format!("cannot read {}: {e}", file.name),
                    )
                })?;
                Cow::Owned(bytes)
            }
        };

        self.check_size(file, bytes.len() as u64)?;
        Ok(bytes)
    }

    fn check_size(&self, file: &InputFile, size: u64) -> Result<(), StageError> {
        if size > self.max_file_bytes {
            return Err(StageError::validation(
                Stage::FileReader,
                format!(
                    "file {} is {size} bytes, limit is {}",
                    file.name, self.max_file_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Best-effort text extraction; `None` when nothing readable remains
pub fn extract_text(kind: FileKind, bytes: &[u8]) -> Option<String> {
    let text = match kind {
        FileKind::Image => return None,
        kind if kind.is_textual() => std::str::from_utf8(bytes).ok()?.to_string(),
        FileKind::Pdf => {
            let shown = pdf_shown_text(bytes);
            if shown.trim().is_empty() {
                printable_runs(bytes)
            } else {
                shown
            }
        }
        _ => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => printable_runs(bytes),
        },
    };

    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Text drawn by uncompressed PDF content streams, one line per operator
fn pdf_shown_text(bytes: &[u8]) -> String {
    let raw = String::from_utf8_lossy(bytes);
    let mut lines = Vec::new();

    for capture in PDF_SHOW_TEXT.captures_iter(&raw) {
        if let Some(single) = capture.get(1) {
            lines.push(unescape_pdf_literal(single.as_str()));
        } else if let Some(array) = capture.get(2) {
            let joined: String = PDF_LITERAL
                .captures_iter(array.as_str())
                .filter_map(|c| c.get(1))
                .map(|m| unescape_pdf_literal(m.as_str()))
                .collect();
            lines.push(joined);
        }
    }

    lines.retain(|line| !line.trim().is_empty());
    lines.join("\n")
}

fn unescape_pdf_literal(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Runs of printable ASCII at least `MIN_PRINTABLE_RUN` long
fn printable_runs(bytes: &[u8]) -> String {
    bytes
        .split(|b| !(b.is_ascii_graphic() || *b == b' '))
        .filter(|run| run.len() >= MIN_PRINTABLE_RUN)
        .filter_map(|run| std::str::from_utf8(run).ok())
        .map(str::trim)
        .filter(|run| !run.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
