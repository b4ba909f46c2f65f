//! Streamable HTTP transport to an upstream MCP server.
//!
//! Each JSON-RPC message is POSTed to the upstream endpoint. The server may
//! answer with a plain JSON body or with a short SSE stream; in the SSE case
//! the first `data:` event carrying a response is the answer. The session id
//! issued on `initialize` (via the `Mcp-Session-Id` header) is echoed on
//! every subsequent request.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use clip_types::traits::UpstreamTransport;
use clip_types::{ClipError, JsonRpcMessage};

const SESSION_HEADER: &str = "mcp-session-id";

/// HTTP/SSE JSON-RPC transport.
pub struct SseTransport {
    upstream_id: String,
    http: reqwest::Client,
    url: String,
    session: Mutex<Option<String>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl SseTransport {
    pub fn new(upstream_id: &str, url: &str) -> Result<Self, ClipError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ClipError::Upstream(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            upstream_id: upstream_id.to_string(),
            http,
            url: url.to_string(),
            session: Mutex::new(None),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        })
    }

    async fn post(&self, msg: &JsonRpcMessage, timeout: Duration) -> Result<reqwest::Response, ClipError> {
        let mut req = self
            .http
            .post(&self.url)
            .header("accept", "application/json, text/event-stream")
            .json(msg);
        if let Some(session) = self.session.lock().await.as_deref() {
            req = req.header(SESSION_HEADER, session);
        }

        let response = tokio::time::timeout(timeout, req.send())
            .await
            .map_err(|_| {
                ClipError::Timeout(format!(
                    "request to upstream '{}' timed out after {}s",
                    self.upstream_id,
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| {
                self.connected.store(false, Ordering::SeqCst);
                ClipError::Upstream(format!("request to upstream '{}' failed: {e}", self.upstream_id))
            })?;

        // Capture the session id handed out on initialize.
        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session.lock().await = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(ClipError::Upstream(format!(
                "upstream '{}' answered HTTP {status}",
                self.upstream_id
            )));
        }
        Ok(response)
    }

    /// Extract the response for `id` from a JSON or SSE body.
    async fn read_response(&self, response: reqwest::Response, id: u64) -> Result<Value, ClipError> {
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let body = response.text().await.map_err(|e| {
                ClipError::Upstream(format!("failed to read SSE body from '{}': {e}", self.upstream_id))
            })?;
            for line in body.lines() {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() {
                    continue;
                }
                let msg: JsonRpcMessage = match serde_json::from_str(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(upstream = %self.upstream_id, error = %e, "dropping malformed SSE event");
                        continue;
                    }
                };
                if msg.id.as_ref().and_then(Value::as_u64) == Some(id) {
                    return extract_result(&self.upstream_id, msg);
                }
            }
            Err(ClipError::Upstream(format!(
                "SSE stream from '{}' ended without a response",
                self.upstream_id
            )))
        } else {
            let msg: JsonRpcMessage = response.json().await.map_err(|e| {
                ClipError::Upstream(format!("malformed response from '{}': {e}", self.upstream_id))
            })?;
            extract_result(&self.upstream_id, msg)
        }
    }
}

fn extract_result(upstream: &str, msg: JsonRpcMessage) -> Result<Value, ClipError> {
    match msg.error {
        Some(err) => Err(ClipError::Upstream(format!(
            "upstream '{upstream}' returned error {}: {}",
            err.code, err.message
        ))),
        None => Ok(msg.result.unwrap_or(Value::Null)),
    }
}

#[async_trait]
impl UpstreamTransport for SseTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClipError> {
        if !self.is_connected() {
            return Err(ClipError::Upstream(format!(
                "upstream '{}' unavailable",
                self.upstream_id
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let msg = JsonRpcMessage::request(id, method, params);
        let response = self.post(&msg, timeout).await?;
        self.read_response(response, id).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClipError> {
        let msg = JsonRpcMessage::notification(method, params);
        // Notifications are fire-and-forget; any 2xx (typically 202) is fine.
        self.post(&msg, Duration::from_secs(10)).await.map(|_| ())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!(upstream = %self.upstream_id, "closed SSE transport");
    }
}
