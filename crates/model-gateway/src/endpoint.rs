use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use signal_core::{ModelRole, TokenUsage};

use crate::error::{ModelError, ModelResult};
use crate::structured::truncate_to_char_boundary;

/// One request to a reasoning-model endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub role: ModelRole,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_output_tokens: u32,
}

/// Raw text answer plus billed usage
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Transport to a single model. Implementations perform exactly one attempt;
/// retries and timeouts are the gateway's job.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> ModelResult<ModelResponse>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// OpenAI-compatible `/chat/completions` endpoint (OpenAI, OpenRouter, Perplexity, ...)
#[derive(Clone)]
pub struct HttpModelEndpoint {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpModelEndpoint {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String, model: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        }
    }

    fn headers(&self) -> ModelResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| ModelError::ClientError {
                status: 0,
                message: format!("invalid API key header: {}", e),
            })?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }
}

/// Seconds form of a `Retry-After` header. HTTP-date values are ignored.
///
/// Values too large for a `Duration` saturate; the gateway caps every wait at `max_delay`.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    let secs: f64 = value.trim().parse().ok()?;
    if secs.is_nan() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
}

#[async_trait]
impl ModelEndpoint for HttpModelEndpoint {
    async fn complete(&self, request: &ModelRequest) -> ModelResult<ModelResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user_prompt,
                },
            ],
            max_tokens: request.max_output_tokens,
            temperature: 0.2,
        };

        tracing::debug!(role = %request.role, model = %self.model, "Model request");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Timeout(Duration::ZERO)
                } else {
                    ModelError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(
                status.as_u16(),
                truncate_to_char_boundary(&text, 500).to_string(),
                retry_after,
            ));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| ModelError::Transport(e.to_string()))?;
        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| ModelError::Parse {
            reason: format!("malformed completion envelope: {}", e),
            raw: truncate_to_char_boundary(&raw, 2000).to_string(),
        })?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(ModelResponse { text, usage })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
