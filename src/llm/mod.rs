//! LLM provider abstraction layer
//!
//! Provider-agnostic completion interface with Anthropic and OpenAI backends.

pub mod provider;
pub mod providers;

pub use provider::*;
pub use providers::*;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use std::sync::Arc;

/// Build the configured provider, reading the API key from the environment
pub fn create_provider(config: &PipelineConfig) -> Result<Arc<dyn LlmProvider>, PipelineError> {
    let api_key = config.get_llm_api_key()?;
    let timeout = config.llm_timeout();

    match config.llm.provider.as_str() {
        "anthropic" => {
            let mut provider_config = AnthropicConfig {
                api_key,
                timeout,
                ..Default::default()
            };
            if let Some(base_url) = &config.llm.base_url {
                provider_config.base_url = base_url.clone();
            }
            Ok(Arc::new(AnthropicProvider::new(provider_config)?))
        }
        "openai" => {
            let mut provider_config = OpenAiConfig {
                api_key,
                timeout,
                ..Default::default()
            };
            if let Some(base_url) = &config.llm.base_url {
                provider_config.base_url = base_url.clone();
            }
            Ok(Arc::new(OpenAiProvider::new(provider_config)?))
        }
        other => Err(PipelineError::configuration(format!(
            "Unsupported LLM provider: {other}"
        ))),
    }
}
