//! Error taxonomy for the takeoff pipeline
//!
//! Two layers: [`StageError`] is the value recorded on a task's shared state
//! when a run halts, and [`PipelineError`] is returned by API-level calls
//! (submitting, looking up or cancelling tasks) that fail before or outside a
//! run.

use crate::agents::Stage;
use crate::config::ConfigError;
use crate::llm::LlmError;
use crate::state::TaskId;
use crate::store::StoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a run halted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or missing stage input; fixed only by resubmitting
    Validation,
    /// External call kept failing after the retry budget was spent
    TransientIo,
    /// Invalid stage subset, reported before any agent runs
    Configuration,
    /// Caller requested cancellation between stages
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure recorded on the shared state of a halted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageError {
    pub kind: ErrorKind,
    /// Stage that failed, or the stage that was about to start when cancelled
    pub stage: Option<Stage>,
    pub message: String,
}

impl StageError {
    pub fn new(kind: ErrorKind, stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: sanitize_error_message(&message.into()),
        }
    }

    pub fn validation(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, Some(stage), message)
    }

    pub fn transient_io(stage: Stage, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientIo, Some(stage), message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, None, message)
    }

    pub fn cancelled(next_stage: Option<Stage>) -> Self {
        let message = match next_stage {
            Some(stage) => format!("Task cancelled before {} started", stage.name()),
            None => "Task cancelled".to_string(),
        };
        Self::new(ErrorKind::Cancelled, next_stage, message)
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", self.kind, stage.name(), self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// Errors returned by the task-level API
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid configuration file: {0}")]
    Config(#[from] ConfigError),

    #[error("LLM provider error: {0}")]
    Llm(#[from] LlmError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl PipelineError {
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Taxonomy kind for errors that have one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            PipelineError::Configuration { .. } | PipelineError::Config(_) => {
                Some(ErrorKind::Configuration)
            }
            _ => None,
        }
    }

    /// Sanitized message safe to hand to clients
    pub fn public_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("secret pattern is valid")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("path pattern is valid")
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, cap the length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();
    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], suffix);
    }

    sanitized
}
