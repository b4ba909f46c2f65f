/// MCP wire types shared by the front-end and the upstream transports.
///
/// CLIP speaks plain JSON-RPC 2.0 on both sides and is transparent to
/// message shapes beyond the `tools/*` verbs it shapes, so the envelope
/// type is a single permissive struct rather than a tagged enum.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC error code: parse error.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC error code: method (or tool) not found.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC error code: invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// JSON-RPC error code: upstream or server-side failure.
pub const UPSTREAM_ERROR: i64 = -32000;

/// A JSON-RPC 2.0 message for MCP communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (None for notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result (for responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (for error responses).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcMessage {
    /// Build a request with the given id, method, and params.
    pub fn request(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::from(id)),
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id, no response expected).
    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a success response for the given request id.
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response for the given request id.
    pub fn error_response(id: Option<Value>, code: i64, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
        }
    }

    /// True if this message is a notification (a method without an id).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }
}

/// An MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    /// Tool name.
    pub name: String,
    /// Tool description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema for the tool's input.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// A single content entry in a `tools/call` result.
///
/// Text entries are the shaping surface (masking and summarization operate
/// on them); every other content kind passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContentItem {
    /// A `{type: "text", text: ...}` entry.
    Text(TextContent),
    /// Any non-text content (images, resources, ...), passed through verbatim.
    Other(Value),
}

/// A text content entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: String,
    pub text: String,
}

impl ContentItem {
    /// Build a text content entry.
    pub fn text(text: impl Into<String>) -> Self {
        ContentItem::Text(TextContent {
            kind: "text".to_string(),
            text: text.into(),
        })
    }

    /// The text payload, if this is a text entry.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentItem::Text(t) if t.kind == "text" => Some(&t.text),
            _ => None,
        }
    }
}

/// The result of a `tools/call`, possibly reshaped before it reaches the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    /// Content entries returned by the tool.
    #[serde(default)]
    pub content: Vec<ContentItem>,
    /// Whether the tool itself reported an error.
    #[serde(rename = "isError", default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Result metadata; CLIP records its shaping annotations under
    /// `_meta.clipShaping`.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// Shaping annotations attached to every response that went through the
/// call pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapingMeta {
    /// Whether the body was replaced by a summary.
    pub compressed: bool,
    /// Estimated token count of the body before shaping.
    pub original_tokens: u32,
    /// Estimated token count of the summary, when compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_tokens: Option<u32>,
    /// Number of PII substrings redacted.
    pub masked_count: u32,
    /// Why compression was skipped after being attempted, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_error: Option<String>,
    /// Whether this response was served from the cache.
    pub cache_hit: bool,
    /// When the response was shaped.
    pub shaped_at: DateTime<Utc>,
}

impl ToolCallResult {
    /// Concatenate all text content entries into one blob.
    pub fn text_body(&self) -> String {
        let parts: Vec<&str> = self.content.iter().filter_map(|c| c.as_text()).collect();
        parts.join("\n")
    }

    /// Attach shaping annotations under `_meta.clipShaping`.
    pub fn set_shaping(&mut self, shaping: &ShapingMeta) {
        let meta = self
            .meta
            .get_or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = meta {
            if let Ok(v) = serde_json::to_value(shaping) {
                map.insert("clipShaping".to_string(), v);
            }
        }
    }

    /// Read back the shaping annotations, if present.
    pub fn shaping(&self) -> Option<ShapingMeta> {
        let v = self.meta.as_ref()?.get("clipShaping")?;
        serde_json::from_value(v.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let msg = JsonRpcMessage::request(7, "tools/list", Some(json!({})));
        let text = serde_json::to_string(&msg).unwrap();
        let back: JsonRpcMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back.id, Some(json!(7)));
        assert_eq!(back.method.as_deref(), Some("tools/list"));
        assert!(back.result.is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = JsonRpcMessage::notification("notifications/initialized", None);
        assert!(msg.is_notification());
        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("\"id\""));
    }

    #[test]
    fn test_error_response_shape() {
        let msg = JsonRpcMessage::error_response(Some(json!(1)), METHOD_NOT_FOUND, "nope".into());
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(v["error"]["message"], json!("nope"));
        assert!(v.get("result").is_none());
    }

    #[test]
    fn test_tool_def_input_schema_rename() {
        let def: McpToolDef = serde_json::from_value(json!({
            "name": "fetch",
            "description": "Fetch a URL",
            "inputSchema": {"type": "object", "properties": {"url": {"type": "string"}}}
        }))
        .unwrap();
        assert_eq!(def.name, "fetch");
        let back = serde_json::to_value(&def).unwrap();
        assert!(back.get("inputSchema").is_some());
    }

    #[test]
    fn test_content_item_text_vs_other() {
        let text: ContentItem =
            serde_json::from_value(json!({"type": "text", "text": "hello"})).unwrap();
        assert_eq!(text.as_text(), Some("hello"));

        let image: ContentItem =
            serde_json::from_value(json!({"type": "image", "data": "...", "mimeType": "image/png"}))
                .unwrap();
        assert!(image.as_text().is_none());
        // Non-text entries survive a round trip byte-for-byte.
        let back = serde_json::to_value(&image).unwrap();
        assert_eq!(back["type"], json!("image"));
    }

    #[test]
    fn test_text_body_joins_text_entries() {
        let result = ToolCallResult {
            content: vec![
                ContentItem::text("a"),
                ContentItem::Other(json!({"type": "image", "data": "x"})),
                ContentItem::text("b"),
            ],
            is_error: None,
            meta: None,
        };
        assert_eq!(result.text_body(), "a\nb");
    }

    #[test]
    fn test_shaping_meta_round_trip() {
        let mut result = ToolCallResult {
            content: vec![ContentItem::text("body")],
            is_error: None,
            meta: Some(json!({"other": true})),
        };
        let shaping = ShapingMeta {
            compressed: true,
            original_tokens: 1200,
            summary_tokens: Some(140),
            masked_count: 2,
            compression_error: None,
            cache_hit: false,
            shaped_at: Utc::now(),
        };
        result.set_shaping(&shaping);

        // Existing meta keys are preserved.
        assert_eq!(result.meta.as_ref().unwrap()["other"], json!(true));
        let back = result.shaping().unwrap();
        assert!(back.compressed);
        assert_eq!(back.original_tokens, 1200);
        assert_eq!(back.summary_tokens, Some(140));
        assert_eq!(back.masked_count, 2);
    }
}
