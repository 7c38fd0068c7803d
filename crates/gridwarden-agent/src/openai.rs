//! OpenAI-compatible planner gateway
//!
//! Speaks the `/chat/completions` protocol, so any compatible endpoint
//! (OpenAI, OpenRouter, a local server) can act as the planner.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use gridwarden_core::config::PlannerConfig;
use gridwarden_core::planner::ResponseFormat;
use gridwarden_core::{PlannerGateway, PlannerRequest, PlannerResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Planner backed by a chat-completions endpoint
#[derive(Debug, Clone)]
pub struct OpenAiPlanner {
    /// Provider name used in logs and breaker errors
    pub name: String,
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    headers: HashMap<String, String>,
    http_client: reqwest::Client,
}

impl OpenAiPlanner {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, api_key: Option<String>) -> Self {
        let defaults = PlannerConfig::default();
        Self {
            name: "openai".to_string(),
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            headers: HashMap::new(),
            http_client: reqwest::Client::new(),
        }
    }

    /// Build from configuration, reading the key from `api_key_env`
    pub fn from_config(config: &PlannerConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GatewayError::MissingApiKey(config.api_key_env.clone()))?;
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http_client,
            ..Self::new(&config.base_url, &config.model, Some(api_key))
                .with_temperature(config.temperature)
                .with_max_tokens(config.max_tokens)
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn request_completion(&self, request: &PlannerRequest) -> Result<PlannerResponse> {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Some(request.system_prompt.clone()),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: Some(request.message.clone()),
                },
            ],
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            response_format: match request.response_format {
                ResponseFormat::Json => Some(ResponseFormatSpec {
                    kind: "json_object".to_string(),
                }),
                ResponseFormat::Text => None,
            },
        };

        let mut builder = self.http_client.post(self.endpoint());
        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        tracing::debug!(provider = %self.name, model = %self.model, "sending planner request");
        let response = builder.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(provider = %self.name, status = status.as_u16(), "planner API error");
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or(GatewayError::EmptyCompletion)?;
        let message = choice
            .message
            .content
            .filter(|text| !text.trim().is_empty())
            .ok_or(GatewayError::EmptyCompletion)?;
        let truncated = choice.finish_reason.as_deref() == Some("length");
        if truncated {
            tracing::warn!(provider = %self.name, "planner output hit the token limit");
        }
        if let Some(tokens) = completion.usage.and_then(|u| u.total_tokens) {
            tracing::debug!(provider = %self.name, tokens, "planner request finished");
        }

        Ok(PlannerResponse { message, truncated })
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormatSpec>,
}

#[derive(Debug, Serialize)]
struct ResponseFormatSpec {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<UsageInfo>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    total_tokens: Option<u32>,
}

#[async_trait]
impl PlannerGateway for OpenAiPlanner {
    async fn complete(&self, request: PlannerRequest) -> anyhow::Result<PlannerResponse> {
        Ok(self.request_completion(&request).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn completion(content: &str, finish_reason: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": finish_reason}],
            "usage": {"total_tokens": 42}
        })
    }

    #[tokio::test]
    async fn test_json_request_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "planner-model",
                "response_format": {"type": "json_object"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"steps": []}"#, "stop")))
            .expect(1)
            .mount(&server)
            .await;

        let planner = OpenAiPlanner::new(format!("{}/v1/", server.uri()), "planner-model", Some("sk-test".into()));
        let response = planner
            .complete(PlannerRequest::json("plan things", "fill column C"))
            .await
            .unwrap();

        assert_eq!(response.message, r#"{"steps": []}"#);
        assert!(!response.truncated);
    }

    #[tokio::test]
    async fn test_length_finish_marks_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"steps": [{"ord"#, "length")))
            .mount(&server)
            .await;

        let planner = OpenAiPlanner::new(server.uri(), "m", None);
        let response = planner.complete(PlannerRequest::json("s", "m")).await.unwrap();
        assert!(response.truncated);
    }

    #[tokio::test]
    async fn test_server_error_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let planner = OpenAiPlanner::new(server.uri(), "m", None);
        let err = planner.complete(PlannerRequest::json("s", "m")).await.unwrap_err();
        match err.downcast_ref::<GatewayError>() {
            Some(GatewayError::Api { status, body }) => {
                assert_eq!(*status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_choices_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
            .mount(&server)
            .await;

        let planner = OpenAiPlanner::new(server.uri(), "m", None);
        let err = planner.complete(PlannerRequest::json("s", "m")).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<GatewayError>(), Some(GatewayError::EmptyCompletion)));
    }

    #[test]
    fn test_missing_key_variable() {
        let config = PlannerConfig {
            api_key_env: "GRIDWARDEN_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..PlannerConfig::default()
        };
        let err = OpenAiPlanner::from_config(&config).unwrap_err();
        assert!(matches!(err, GatewayError::MissingApiKey(_)));
    }
}
