/// Trait contracts at the external seams of the proxy.
///
/// The pipeline and registry code against these interfaces, not against
/// concrete transports or HTTP clients, so every stage can be exercised in
/// tests with in-memory fakes.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::ClipError;

/// A live session to one upstream MCP server, regardless of transport.
///
/// Implementations multiplex concurrent requests over one connection and
/// must pair responses to requests by JSON-RPC id.
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Send a request and await the matching response's `result`.
    ///
    /// A JSON-RPC error response becomes `ClipError::Upstream`; exceeding
    /// `timeout` becomes `ClipError::Timeout` and abandons the awaiter.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClipError>;

    /// Send a notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClipError>;

    /// Whether the session is still usable.
    fn is_connected(&self) -> bool;

    /// Tear down the session.
    async fn close(&self);
}

/// A chat-completion request to an LLM endpoint.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// System prompt.
    pub system: String,
    /// User message.
    pub user: String,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

/// A chat-completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The generated text.
    pub content: String,
}

/// An LLM endpoint used by the summarizer and the masker fallback.
#[async_trait]
pub trait ChatCompletionClient: Send + Sync {
    /// Send a completion request and return the model's text.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ClipError>;
}
