//! LLM provider abstraction and trait definitions
//!
//! Every pipeline stage that needs a model talks to it through [`LlmProvider`],
//! which keeps the agents independent of the concrete backend and lets tests
//! swap in scripted providers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Metadata key carrying the pipeline stage that issued a request
pub const METADATA_STAGE: &str = "stage";
/// Metadata key carrying the task the request belongs to
pub const METADATA_TASK_ID: &str = "task_id";

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

/// Message roles in a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// LLM completion request parameters
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub metadata: HashMap<String, String>,
}

/// LLM completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: Option<String>,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: FinishReason,
    pub metadata: HashMap<String, String>,
}

/// Token usage statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Reason why completion finished
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Error,
}

/// LLM provider trait for dependency injection and testing
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Get the provider name (e.g., "openai", "anthropic")
    fn name(&self) -> &str;

    /// Generate a completion from the given request
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Check if the provider is configured and ready
    async fn health_check(&self) -> Result<(), LlmError>;
}

/// LLM provider errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("API error: {0}")]
    ApiError(String),
}

impl LlmError {
    /// Whether a retry of the same request can reasonably succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimitExceeded(_)
                | LlmError::Timeout(_)
                | LlmError::ServiceUnavailable(_)
                | LlmError::NetworkError(_)
        )
    }

    /// Map a non-success HTTP status into the matching error variant
    pub fn from_status(provider: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("{provider} API error: {status} - {body}");
        match status.as_u16() {
            401 | 403 => LlmError::AuthenticationFailed(message),
            408 => LlmError::Timeout(message),
            429 => LlmError::RateLimitExceeded(message),
            400 | 404 | 413 | 422 => LlmError::InvalidRequest(message),
            s if s >= 500 => LlmError::ServiceUnavailable(message),
            _ => LlmError::ApiError(message),
        }
    }

    /// Map a transport-level reqwest failure
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            LlmError::Timeout(error.to_string())
        } else {
            LlmError::NetworkError(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        let system = Message::system("You are an estimator.");
        let user = Message::user("Price this.");

        assert_eq!(system.role, MessageRole::System);
        assert_eq!(user.role, MessageRole::User);
        assert_eq!(user.content, "Price this.");
    }

    #[test]
    fn test_transient_classification() {
        assert!(LlmError::Timeout("t".into()).is_transient());
        assert!(LlmError::NetworkError("n".into()).is_transient());
        assert!(LlmError::RateLimitExceeded("r".into()).is_transient());
        assert!(LlmError::ServiceUnavailable("s".into()).is_transient());

        assert!(!LlmError::AuthenticationFailed("a".into()).is_transient());
        assert!(!LlmError::InvalidRequest("i".into()).is_transient());
        assert!(!LlmError::InvalidResponse("i".into()).is_transient());
        assert!(!LlmError::NotConfigured("n".into()).is_transient());
    }

    #[test]
    fn test_status_mapping() {
        use reqwest::StatusCode;

        assert!(matches!(
            LlmError::from_status("x", StatusCode::TOO_MANY_REQUESTS, ""),
            LlmError::RateLimitExceeded(_)
        ));
        assert!(matches!(
            LlmError::from_status("x", StatusCode::BAD_GATEWAY, ""),
            LlmError::ServiceUnavailable(_)
        ));
        assert!(matches!(
            LlmError::from_status("x", StatusCode::UNAUTHORIZED, ""),
            LlmError::AuthenticationFailed(_)
        ));
        assert!(matches!(
            LlmError::from_status("x", StatusCode::BAD_REQUEST, ""),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            LlmError::from_status("x", StatusCode::IM_A_TEAPOT, ""),
            LlmError::ApiError(_)
        ));
    }

    #[test]
    fn test_message_role_serialization() {
        assert_eq!(
            serde_json::to_string(&MessageRole::System).unwrap(),
            "\"system\""
        );
        assert_eq!(
            serde_json::to_string(&MessageRole::Assistant).unwrap(),
            "\"assistant\""
        );
    }
}
