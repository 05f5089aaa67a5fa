//! Pipeline configuration loaded from TOML
//!
//! The file is validated on load; API keys are never stored in it, only the
//! name of the environment variable holding them.

use crate::retry::MAX_RETRY_ATTEMPTS;
use crate::state::ExportFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    pub service: ServiceSection,
    pub llm: LlmSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub progress: ProgressSection,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Service identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default)]
    pub description: String,
}

/// LLM backend settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSection {
    /// Provider name ("anthropic" or "openai")
    pub provider: String,
    pub model: String,
    /// Environment variable containing the API key
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Override of the provider's API base URL
    pub base_url: Option<String>,
}

fn default_llm_timeout_secs() -> u64 {
    60
}

/// Orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSection {
    /// Preset name or comma separated stage list used when a request names none
    #[serde(default = "default_stages")]
    pub default_stages: String,
    /// Largest input file FileReader accepts
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub qa: QaSection,
    #[serde(default)]
    pub export: ExportSection,
}

fn default_stages() -> String {
    "full".to_string()
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            default_stages: default_stages(),
            max_file_bytes: default_max_file_bytes(),
            retry: RetrySection::default(),
            qa: QaSection::default(),
            export: ExportSection::default(),
        }
    }
}

/// Retry policy for transient LLM failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetrySection {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// QA gate settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QaSection {
    /// Reviews below this confidence block the run
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
}

fn default_confidence_threshold() -> f64 {
    0.5
}

impl Default for QaSection {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExportSection {
    #[serde(default)]
    pub format: ExportFormat,
}

/// HTTP listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory `POST /tasks` may read `path` inputs from; unset means
    /// HTTP callers must send inline text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_root: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            upload_root: None,
        }
    }
}

/// Progress fan-out settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            enabled: true,
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid service ID format: {0}")]
    InvalidServiceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_id(&self.service.id)?;

        match self.llm.provider.as_str() {
            "anthropic" | "openai" => {}
            other => {
                return Err(ConfigError::InvalidConfig(format!(
                    "Unsupported LLM provider '{other}' (expected anthropic or openai)"
                )))
            }
        }

        if let Some(temperature) = self.llm.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::InvalidConfig(format!(
                    "llm.temperature {temperature} must be between 0.0 and 2.0"
                )));
            }
        }

        crate::pipeline::parse_stages(&self.pipeline.default_stages).map_err(|error| {
            ConfigError::InvalidConfig(format!("pipeline.default_stages: {error}"))
        })?;

        let retry = &self.pipeline.retry;
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&retry.max_attempts) {
            return Err(ConfigError::InvalidConfig(format!(
                "pipeline.retry.max_attempts {} must be between 1 and {MAX_RETRY_ATTEMPTS}",
                retry.max_attempts
            )));
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "pipeline.retry.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                retry.initial_backoff_ms, retry.max_backoff_ms
            )));
        }

        let threshold = self.pipeline.qa.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::InvalidConfig(format!(
                "pipeline.qa.confidence_threshold {threshold} must be between 0.0 and 1.0"
            )));
        }

        if self.pipeline.max_file_bytes == 0 {
            return Err(ConfigError::InvalidConfig(
                "pipeline.max_file_bytes must be greater than zero".to_string(),
            ));
        }

        if self.progress.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "progress.channel_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Get LLM API key from its environment variable
    pub fn get_llm_api_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.llm.api_key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.llm.api_key_env.clone()))
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }

    /// Configuration used by unit and integration tests
    pub fn test_config() -> Self {
        Self {
            service: ServiceSection {
                id: "test-pipeline".to_string(),
                description: "Pipeline under test".to_string(),
            },
            llm: LlmSection {
                provider: "anthropic".to_string(),
                model: "mock-model".to_string(),
                api_key_env: "ANTHROPIC_API_KEY".to_string(),
                temperature: Some(0.2),
                max_tokens: Some(2048),
                timeout_secs: 5,
                base_url: None,
            },
            pipeline: PipelineSection {
                retry: RetrySection {
                    max_attempts: 3,
                    initial_backoff_ms: 1,
                    max_backoff_ms: 4,
                },
                ..PipelineSection::default()
            },
            server: ServerSection::default(),
            progress: ProgressSection::default(),
        }
    }
}

/// Validate service ID format
fn validate_service_id(id: &str) -> Result<(), ConfigError> {
    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidServiceId(format!(
            "Service ID '{id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
