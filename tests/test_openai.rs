//! Integration tests for the OpenAI provider
//!
//! Covers chat completion handling, error classification and the
//! stage-level retry loop running against a real HTTP provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use takeoff_agents::agents::{ModelSettings, Stage, StageContext};
use takeoff_agents::error::ErrorKind;
use takeoff_agents::llm::provider::{
    CompletionRequest, FinishReason, LlmError, LlmProvider, Message, METADATA_STAGE,
    METADATA_TASK_ID,
};
use takeoff_agents::llm::providers::openai::{OpenAiConfig, OpenAiProvider};
use takeoff_agents::retry::RetryPolicy;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_config(base_url: &str) -> OpenAiConfig {
    OpenAiConfig {
        api_key: "test-api-key".to_string(),
        base_url: base_url.to_string(),
        timeout: Duration::from_secs(5),
    }
}

fn test_request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user("Measure the partitions on A-101")],
        model: "gpt-4o".to_string(),
        max_tokens: Some(256),
        temperature: Some(0.2),
        metadata: HashMap::new(),
    }
}

fn chat_response(content: &str, finish_reason: &str) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": finish_reason
        }],
        "usage": {"prompt_tokens": 30, "completion_tokens": 12, "total_tokens": 42}
    })
}

fn stage_context(provider: OpenAiProvider) -> StageContext {
    StageContext::new(
        Uuid::new_v4(),
        Arc::new(provider),
        ModelSettings {
            model: "gpt-4o".to_string(),
            temperature: Some(0.2),
            max_tokens: Some(512),
        },
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(4)),
    )
}

#[tokio::test]
async fn test_openai_provider_returns_successful_completion() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer test-api-key"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_response("[{\"quantity\":840}]", "stop")),
        )
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let response = provider.complete(test_request()).await.unwrap();

    assert_eq!(response.content.as_deref(), Some("[{\"quantity\":840}]"));
    assert_eq!(response.model, "gpt-4o");
    assert_eq!(response.usage.total_tokens, 42);
    assert!(matches!(response.finish_reason, FinishReason::Stop));
}

#[tokio::test]
async fn test_openai_provider_sends_roles_in_order() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(serde_json::json!({
            "model": "gpt-4o",
            "messages": [
                {"role": "system", "content": "You are a quantity surveyor."},
                {"role": "user", "content": "Count the doors"}
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("[]", "stop")))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let mut request = test_request();
    request.messages = vec![
        Message::system("You are a quantity surveyor."),
        Message::user("Count the doors"),
    ];

    assert!(provider.complete(request).await.is_ok());
}

#[tokio::test]
async fn test_openai_provider_maps_401_to_authentication_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "error": {"message": "Incorrect API key provided", "type": "invalid_request_error"}
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let error = provider.complete(test_request()).await.unwrap_err();

    assert!(matches!(error, LlmError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_openai_provider_maps_context_length_error_to_invalid_request() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": {
                "message": "This model's maximum context length is 128000 tokens",
                "code": "context_length_exceeded"
            }
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let error = provider.complete(test_request()).await.unwrap_err();

    match error {
        LlmError::InvalidRequest(message) => assert!(message.contains("context length")),
        other => panic!("Expected InvalidRequest, got {other:?}"),
    }
}

#[tokio::test]
async fn test_openai_provider_converts_finish_reasons() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_response("[{\"id\":", "length")),
        )
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("", "content_filter")))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();

    let first = provider.complete(test_request()).await.unwrap();
    assert!(matches!(first.finish_reason, FinishReason::Length));
    let second = provider.complete(test_request()).await.unwrap();
    assert!(matches!(second.finish_reason, FinishReason::ContentFilter));
}

#[tokio::test]
async fn test_openai_provider_rejects_empty_choices() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "model": "gpt-4o",
            "choices": [],
            "usage": {"prompt_tokens": 1, "completion_tokens": 0, "total_tokens": 1}
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let error = provider.complete(test_request()).await.unwrap_err();

    assert!(matches!(error, LlmError::InvalidResponse(_)));
}

#[tokio::test]
async fn test_stage_retries_transient_server_errors() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service temporarily unavailable"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_response("[\"Drywall\"]", "stop")),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let ctx = stage_context(provider);

    let reply = ctx
        .complete(Stage::TradeMapper, "Map trades", "A-101".to_string())
        .await
        .unwrap();

    assert_eq!(reply, "[\"Drywall\"]");
}

#[tokio::test]
async fn test_stage_gives_up_after_retry_budget() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_string("Service unavailable"))
        .expect(3)
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let ctx = stage_context(provider);

    let error = ctx
        .complete(Stage::Takeoff, "Measure", "A-101".to_string())
        .await
        .unwrap_err();

    assert_eq!(error.kind, ErrorKind::TransientIo);
    assert_eq!(error.stage, Some(Stage::Takeoff));
}

#[tokio::test]
async fn test_stage_does_not_retry_authentication_failure() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let ctx = stage_context(provider);

    let error = ctx
        .complete(Stage::Scope, "Scope", "A-101".to_string())
        .await
        .unwrap_err();

    assert_eq!(error.stage, Some(Stage::Scope));
}

#[tokio::test]
async fn test_openai_provider_preserves_request_metadata() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_response("[]", "stop")))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    let mut request = test_request();
    request
        .metadata
        .insert(METADATA_STAGE.to_string(), "estimator".to_string());
    request
        .metadata
        .insert(METADATA_TASK_ID.to_string(), "task-1".to_string());

    let response = provider.complete(request).await.unwrap();
    assert_eq!(
        response.metadata.get(METADATA_STAGE).map(String::as_str),
        Some("estimator")
    );
    assert_eq!(response.metadata.len(), 2);
}

#[tokio::test]
async fn test_openai_health_check_uses_models_endpoint() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .and(header("Authorization", "Bearer test-api-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
        .mount(&mock_server)
        .await;

    let provider = OpenAiProvider::new(test_config(&mock_server.uri())).unwrap();
    assert!(provider.health_check().await.is_ok());
}

#[test]
fn test_openai_provider_creation_requires_api_key() {
    let result = OpenAiProvider::new(OpenAiConfig::default());
    assert!(matches!(result, Err(LlmError::NotConfigured(_))));
}

#[test]
fn test_openai_provider_reports_name() {
    let provider = OpenAiProvider::new(test_config("http://localhost")).unwrap();
    assert_eq!(provider.name(), "openai");
}
