//! OpenAI-style chat-completions client.
//!
//! One client instance per consumer (summarizer, masker fallback), each with
//! its own request timeout. The wire format is the plain
//! `POST {base_url}/chat/completions` shape; the response text is taken from
//! the first choice.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use clip_types::config::LlmConfig;
use clip_types::traits::{ChatCompletionClient, ChatRequest, ChatResponse};
use clip_types::ClipError;

/// Request body for a chat-completions endpoint.
#[derive(Debug, Serialize)]
struct CompletionsRequest {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: u32,
}

/// A chat message in the request/response body.
#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

/// Response body from a chat-completions endpoint.
#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ApiMessage,
}

/// HTTP client for an OpenAI-style chat-completions endpoint.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    /// Build a client for the configured endpoint with a per-request timeout.
    pub fn new(config: &LlmConfig, timeout: Duration) -> Result<Self, ClipError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClipError::Llm(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }
}

#[async_trait]
impl ChatCompletionClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ClipError> {
        let body = CompletionsRequest {
            model: self.model.clone(),
            messages: vec![
                ApiMessage {
                    role: "system".to_string(),
                    content: request.system,
                },
                ApiMessage {
                    role: "user".to_string(),
                    content: request.user,
                },
            ],
            max_tokens: request.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ClipError::Timeout(format!("LLM request to {url} timed out"))
            } else {
                ClipError::Llm(format!("HTTP request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let excerpt: String = body.chars().take(200).collect();
            return Err(ClipError::Llm(format!("HTTP {status}: {excerpt}")));
        }

        let parsed: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| ClipError::Llm(format!("failed to parse response: {e}")))?;

        let first = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ClipError::Llm("response contained no choices".to_string()))?;

        Ok(ChatResponse {
            content: first.message.content,
        })
    }
}
