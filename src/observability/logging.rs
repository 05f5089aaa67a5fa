//! Tracing setup and the span macros used across the pipeline
//!
//! Settings come from the environment:
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO (default), DEBUG or TRACE
//! - `LOG_FORMAT`: `json` (default), `pretty` or `compact`
//! - `LOG_SPANS`: `true`/`1` to log span open and close, which gives per-stage
//!   timings for every task
//! - `RUST_LOG`: replaces the level filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG takeoff-agents run --query "drywall takeoff"
//! ```
//!
//! Spans nest as `task_run` > `pipeline_stage`, so every line logged by an
//! agent carries the task id and the stage it belongs to.

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Crates whose chatter is held at WARN unless `RUST_LOG` says otherwise
const QUIET_DEPENDENCIES: &[&str] = &["hyper", "reqwest", "warp", "tokio"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    Pretty,
    /// Single-line, no targets
    Compact,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// Raw `RUST_LOG` directive, used instead of `level` when set
    pub directive: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Json,
            include_spans: false,
            directive: None,
        }
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            level: lookup("LOG_LEVEL").map_or(defaults.level, |v| parse_level(&v)),
            format: lookup("LOG_FORMAT").map_or(defaults.format, |v| LogFormat::parse(&v)),
            include_spans: lookup("LOG_SPANS").is_some_and(|v| parse_flag(&v)),
            directive: lookup("RUST_LOG").filter(|v| !v.trim().is_empty()),
        }
    }

    /// Filter directive handed to the subscriber
    pub fn filter_directive(&self) -> String {
        if let Some(directive) = &self.directive {
            return directive.clone();
        }
        let mut directive = self.level.to_string().to_lowercase();
        for name in QUIET_DEPENDENCIES {
            directive.push_str(&format!(",{name}=warn"));
        }
        directive
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(settings: &LogSettings) -> Result<(), TryInitError> {
    let subscriber =
        tracing_subscriber::registry().with(EnvFilter::new(settings.filter_directive()));

    match settings.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(settings.span_events()))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(settings.span_events()),
            )
            .try_init(),
    }
}

/// Map a LOG_LEVEL value to a tracing level, defaulting to INFO
pub fn parse_level(value: &str) -> Level {
    match value.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1")
}

/// Span covering one task run
#[macro_export]
macro_rules! task_span {
    ($($field:tt)*) => {
        tracing::info_span!("task_run", $($field)*)
    };
}

/// Span covering one stage of a run
#[macro_export]
macro_rules! stage_span {
    ($($field:tt)*) => {
        tracing::info_span!("pipeline_stage", $($field)*)
    };
}

#[macro_export]
macro_rules! http_span {
    ($($field:tt)*) => {
        tracing::info_span!("http_request", $($field)*)
    };
}

pub use {http_span, stage_span, task_span};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_variables() {
        assert_eq!(settings(&[]), LogSettings::default());
    }

    #[test]
    fn test_variables_are_read() {
        let resolved = settings(&[
            ("LOG_LEVEL", "debug"),
            ("LOG_FORMAT", "Compact"),
            ("LOG_SPANS", "1"),
        ]);
        assert_eq!(resolved.level, Level::DEBUG);
        assert_eq!(resolved.format, LogFormat::Compact);
        assert!(resolved.include_spans);
    }

    #[test]
    fn test_spans_need_an_explicit_yes() {
        for value in ["false", "", "yes", "0"] {
            assert!(!settings(&[("LOG_SPANS", value)]).include_spans, "{value}");
        }
        assert!(settings(&[("LOG_SPANS", "TRUE")]).include_spans);
    }

    #[test]
    fn test_filter_quiets_dependencies() {
        let directive = settings(&[("LOG_LEVEL", "TRACE")]).filter_directive();
        assert!(directive.starts_with("trace,"), "{directive}");
        assert!(directive.contains("reqwest=warn"));
        assert!(directive.contains("warp=warn"));
    }

    #[test]
    fn test_rust_log_replaces_level_filter() {
        let resolved = settings(&[("LOG_LEVEL", "ERROR"), ("RUST_LOG", "takeoff_agents=trace")]);
        assert_eq!(resolved.filter_directive(), "takeoff_agents=trace");

        let blank = settings(&[("RUST_LOG", "  ")]);
        assert!(blank.directive.is_none());
    }

    #[test]
    fn test_unknown_format_is_json() {
        assert_eq!(LogFormat::parse("yaml"), LogFormat::Json);
        assert_eq!(LogFormat::parse("PrEtTy"), LogFormat::Pretty);
    }
}
