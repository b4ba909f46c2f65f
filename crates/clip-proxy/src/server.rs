//! MCP front-end.
//!
//! Presents a single MCP server to the client over newline-delimited
//! JSON-RPC, generic over the reader/writer pair (stdin/stdout in
//! production, buffers in tests). Requests are handled sequentially, so a
//! client's responses come back in request order. Malformed frames are
//! logged and dropped without ending the session; notifications never get
//! responses.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use clip_types::mcp::{INVALID_PARAMS, METHOD_NOT_FOUND, UPSTREAM_ERROR};
use clip_types::{ClipError, JsonRpcMessage};

use crate::pipeline::CallPipeline;
use crate::upstream::UpstreamRegistry;

/// The MCP server loop.
pub struct ProxyServer {
    registry: Arc<UpstreamRegistry>,
    pipeline: CallPipeline,
}

impl ProxyServer {
    pub fn new(registry: Arc<UpstreamRegistry>, pipeline: CallPipeline) -> Self {
        Self { registry, pipeline }
    }

    /// Serve MCP until the reader reaches EOF.
    pub async fn run<R, W>(&self, reader: R, mut writer: W) -> Result<(), ClipError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|e| ClipError::Internal(format!("failed to read from client: {e}")))?;
            let Some(line) = line else {
                debug!("client closed the session");
                return Ok(());
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let msg: JsonRpcMessage = match serde_json::from_str(line) {
                Ok(msg) => msg,
                Err(e) => {
                    // Drop the frame, keep the session.
                    warn!(error = %e, "dropping malformed frame from client");
                    continue;
                }
            };

            if let Some(response) = self.handle_message(msg).await {
                let mut text = serde_json::to_string(&response)?;
                text.push('\n');
                writer
                    .write_all(text.as_bytes())
                    .await
                    .map_err(|e| ClipError::Internal(format!("failed to write to client: {e}")))?;
                writer
                    .flush()
                    .await
                    .map_err(|e| ClipError::Internal(format!("failed to flush to client: {e}")))?;
            }
        }
    }

    /// Dispatch one message. Returns None for notifications.
    async fn handle_message(&self, msg: JsonRpcMessage) -> Option<JsonRpcMessage> {
        let Some(method) = msg.method.clone() else {
            // A response-shaped frame from the client; nothing to do.
            debug!("ignoring response-shaped message from client");
            return None;
        };

        if msg.is_notification() {
            debug!(method = %method, "notification received");
            return None;
        }
        let id = msg.id.clone();

        let outcome = match method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": "2025-06-18",
                "capabilities": {"tools": {}},
                "serverInfo": {
                    "name": "clip",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            "ping" => Ok(json!({})),
            "tools/list" => {
                let tools = self.registry.list_tools().await;
                serde_json::to_value(tools)
                    .map(|tools| json!({"tools": tools}))
                    .map_err(ClipError::from)
            }
            "tools/call" => self.handle_tools_call(msg.params).await,
            m if m.starts_with("resources/") || m.starts_with("prompts/") => {
                self.registry.forward(&method, msg.params).await
            }
            _ => {
                return Some(JsonRpcMessage::error_response(
                    id,
                    METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                ));
            }
        };

        Some(match outcome {
            Ok(result) => JsonRpcMessage::success(id, result),
            Err(e) => {
                debug!(method = %method, error = %e, "request failed");
                JsonRpcMessage::error_response(id, error_code(&e), e.to_string())
            }
        })
    }

    async fn handle_tools_call(&self, params: Option<Value>) -> Result<Value, ClipError> {
        let params =
            params.ok_or_else(|| ClipError::Protocol("tools/call without params".to_string()))?;
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ClipError::Protocol("tools/call without a tool name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        // The goal rides in the request metadata and is never forwarded
        // upstream; the pipeline uses it only for goal-aware summarization.
        let goal = params
            .get("_meta")
            .and_then(|m| m.get("goal"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let result = self.pipeline.handle_call(name, arguments, goal).await?;
        serde_json::to_value(result).map_err(ClipError::from)
    }
}

/// Map an error to its JSON-RPC code.
fn error_code(err: &ClipError) -> i64 {
    match err.root() {
        ClipError::ToolNotFound(_) => METHOD_NOT_FOUND,
        ClipError::Protocol(_) => INVALID_PARAMS,
        _ => UPSTREAM_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::tests::{handshake_transport, registry_config, tools_fixture, MockTransport};
    use clip_shaping::{EscalationTracker, PiiMasker, ResponseCache, Summarizer};
    use clip_types::config::{StageTimeouts, UpstreamConfig};
    use clip_types::traits::{ChatCompletionClient, ChatRequest, ChatResponse};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoLlm;

    #[async_trait]
    impl ChatCompletionClient for NoLlm {
        async fn complete(&self, _request: ChatRequest) -> Result<ChatResponse, ClipError> {
            Err(ClipError::Llm("not wired in this test".to_string()))
        }
    }

    async fn build_server() -> (ProxyServer, Arc<MockTransport>) {
        let resolver = registry_config(json!({
            "upstreams": [{
                "id": "srv", "transport": "stdio", "command": "unused",
                "tools": {"dangerous": {"hidden": true}}
            }],
            "compression": {
                "enabled": false,
                "llmConfig": {"baseUrl": "http://localhost", "model": "m"}
            }
        }));
        let registry = Arc::new(UpstreamRegistry::new(
            Arc::clone(&resolver),
            StageTimeouts::default(),
        ));
        let transport = handshake_transport(tools_fixture()).await;
        let config: UpstreamConfig = serde_json::from_value(json!({
            "id": "srv", "transport": "stdio", "command": "unused"
        }))
        .unwrap();
        registry.add_session(config, transport.clone()).await.unwrap();

        let pipeline = CallPipeline::new(
            Arc::clone(&registry),
            resolver,
            ResponseCache::new(),
            Arc::new(PiiMasker::new()),
            Arc::new(Summarizer::new(Arc::new(NoLlm))),
            Arc::new(EscalationTracker::new(None)),
        );
        (ProxyServer::new(registry, pipeline), transport)
    }

    /// Feed a scripted client session and collect the responses.
    async fn drive(server: &ProxyServer, input: &str) -> Vec<JsonRpcMessage> {
        let mut output: Vec<u8> = Vec::new();
        server
            .run(tokio::io::BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_and_ping() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
                "\n"
            ),
        )
        .await;

        // The notification produced no response.
        assert_eq!(responses.len(), 2);
        let init = responses[0].result.as_ref().unwrap();
        assert_eq!(init["serverInfo"]["name"], json!("clip"));
        assert!(init["capabilities"].get("tools").is_some());
        assert_eq!(responses[1].result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_tools_list_hides_hidden_tools() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n",
        )
        .await;

        let tools = responses[0].result.as_ref().unwrap()["tools"]
            .as_array()
            .unwrap()
            .clone();
        let names: Vec<&str> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["srv__fetch"]);
    }

    #[tokio::test]
    async fn test_tools_call_round_trip() {
        let (server, transport) = build_server().await;
        transport
            .on("tools/call", json!({"content": [{"type": "text", "text": "hello"}]}))
            .await;

        let responses = drive(
            &server,
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"srv__fetch","arguments":{"url":"u","api_key":"k"}}}
"#,
        )
        .await;

        let result = responses[0].result.as_ref().unwrap();
        assert_eq!(result["content"][0]["text"], json!("hello"));
        assert!(result["_meta"]["clipShaping"].is_object());
        assert_eq!(responses[0].id, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_hidden_tool_call_is_not_found() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"srv__dangerous","arguments":{}}}
"#,
        )
        .await;

        let error = responses[0].error.as_ref().unwrap();
        assert_eq!(error.code, METHOD_NOT_FOUND);
        assert!(error.message.contains("srv__dangerous"));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"sampling/createMessage\"}\n",
        )
        .await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_frame_dropped_session_survives() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            concat!(
                "this is not json\n",
                r#"{"jsonrpc":"2.0","id":9,"method":"ping"}"#,
                "\n"
            ),
        )
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].id, Some(json!(9)));
    }

    #[tokio::test]
    async fn test_missing_tool_name_is_invalid_params() {
        let (server, _) = build_server().await;
        let responses = drive(
            &server,
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"arguments":{}}}
"#,
        )
        .await;
        assert_eq!(responses[0].error.as_ref().unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_resources_forwarded_to_upstream() {
        let (server, transport) = build_server().await;
        transport.on("resources/list", json!({"resources": []})).await;

        let responses = drive(
            &server,
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"resources/list\"}\n",
        )
        .await;
        assert_eq!(responses[0].result, Some(json!({"resources": []})));
    }

    #[tokio::test]
    async fn test_responses_in_request_order() {
        let (server, transport) = build_server().await;
        transport
            .on("tools/call", json!({"content": [{"type": "text", "text": "first"}]}))
            .await;

        let responses = drive(
            &server,
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"srv__fetch","arguments":{"url":"a"}}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":3,"method":"tools/list"}"#,
                "\n"
            ),
        )
        .await;

        let ids: Vec<_> = responses.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }
}
