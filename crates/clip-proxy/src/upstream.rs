//! Upstream registry.
//!
//! Holds the set of live upstream MCP sessions, their advertised tools, and
//! routes calls by qualified name. Every tool is namespaced as
//! `<upstream_id>__<tool_name>`, so two upstreams can expose identically
//! named tools without colliding.
//!
//! An upstream that fails to start is logged and excluded; the rest keep
//! running (degraded mode). An upstream that dies mid-run keeps its entry
//! but is dropped from the catalog, and calls to it fail with an
//! upstream-unavailable error. There is no automatic reconnection.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use clip_policy::{qualify, split_qualified, PolicyResolver};
use clip_types::config::{StageTimeouts, TransportKind, UpstreamConfig};
use clip_types::traits::UpstreamTransport;
use clip_types::{ClipError, McpToolDef, ToolCallResult};

use crate::transport_sse::SseTransport;
use crate::transport_stdio::StdioTransport;

/// MCP protocol revision sent in the handshake.
const PROTOCOL_VERSION: &str = "2025-06-18";

/// A live upstream session with its cached tool list.
struct UpstreamEntry {
    config: UpstreamConfig,
    transport: Arc<dyn UpstreamTransport>,
    tools: Vec<McpToolDef>,
    /// Capabilities the upstream advertised on initialize; routing for
    /// resources/prompts requests keys off these.
    capabilities: Value,
}

/// Registry of upstream MCP sessions.
pub struct UpstreamRegistry {
    entries: RwLock<HashMap<String, UpstreamEntry>>,
    resolver: Arc<PolicyResolver>,
    timeouts: StageTimeouts,
}

impl UpstreamRegistry {
    pub fn new(resolver: Arc<PolicyResolver>, timeouts: StageTimeouts) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            resolver,
            timeouts,
        }
    }

    /// Start every configured upstream. Failures exclude the one upstream
    /// and leave the rest operational.
    pub async fn connect_all(&self, configs: &[UpstreamConfig]) {
        for config in configs {
            match self.connect_one(config).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        upstream = %config.id,
                        error = %e,
                        "failed to start upstream, excluding it"
                    );
                }
            }
        }
    }

    async fn connect_one(&self, config: &UpstreamConfig) -> Result<(), ClipError> {
        let transport: Arc<dyn UpstreamTransport> = match config.transport {
            TransportKind::Stdio => {
                let command = config.command.as_deref().unwrap_or_default();
                Arc::new(StdioTransport::spawn(&config.id, command, &config.args, &config.env)?)
            }
            TransportKind::Sse => {
                let url = config.url.as_deref().unwrap_or_default();
                Arc::new(SseTransport::new(&config.id, url)?)
            }
        };
        self.add_session(config.clone(), transport).await
    }

    /// Perform the MCP handshake over an already-built transport and
    /// register the session. Split out from [`connect_all`] so sessions can
    /// be registered over arbitrary transports.
    pub async fn add_session(
        &self,
        config: UpstreamConfig,
        transport: Arc<dyn UpstreamTransport>,
    ) -> Result<(), ClipError> {
        {
            let entries = self.entries.read().await;
            if entries.contains_key(&config.id) {
                return Err(ClipError::Upstream(format!(
                    "upstream '{}' is already registered",
                    config.id
                )));
            }
        }

        let init_result = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "clip",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
                self.timeouts.upstream,
            )
            .await?;
        let capabilities = init_result
            .get("capabilities")
            .cloned()
            .unwrap_or_else(|| json!({}));
        transport.notify("notifications/initialized", None).await?;

        let tools = self.fetch_tools(&config.id, transport.as_ref()).await?;
        info!(
            upstream = %config.id,
            tool_count = tools.len(),
            "upstream session established"
        );

        let mut entries = self.entries.write().await;
        entries.insert(
            config.id.clone(),
            UpstreamEntry {
                config,
                transport,
                tools,
                capabilities,
            },
        );
        Ok(())
    }

    async fn fetch_tools(
        &self,
        upstream_id: &str,
        transport: &dyn UpstreamTransport,
    ) -> Result<Vec<McpToolDef>, ClipError> {
        let result = transport
            .request("tools/list", Some(json!({})), self.timeouts.upstream)
            .await?;
        let tools = result
            .get("tools")
            .ok_or_else(|| {
                ClipError::Protocol(format!("tools/list from '{upstream_id}' has no 'tools' field"))
            })?
            .clone();
        serde_json::from_value(tools).map_err(|e| {
            ClipError::Protocol(format!("failed to parse tools from '{upstream_id}': {e}"))
        })
    }

    /// Re-query one upstream's `tools/list` and replace the cached list.
    pub async fn refresh_tools(&self, upstream_id: &str) -> Result<(), ClipError> {
        let transport = {
            let entries = self.entries.read().await;
            let entry = entries.get(upstream_id).ok_or_else(|| {
                ClipError::Upstream(format!("upstream '{upstream_id}' is not registered"))
            })?;
            Arc::clone(&entry.transport)
        };
        let tools = self.fetch_tools(upstream_id, transport.as_ref()).await?;
        debug!(upstream = %upstream_id, tool_count = tools.len(), "refreshed tool list");

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(upstream_id) {
            entry.tools = tools;
        }
        Ok(())
    }

    /// The unioned catalog advertised to the client: qualified names, hidden
    /// tools removed, descriptions overridden, hidden parameters stripped
    /// from the schemas. Tools of dead upstreams drop out.
    pub async fn list_tools(&self) -> Vec<McpToolDef> {
        let entries = self.entries.read().await;
        let mut catalog = Vec::new();

        for entry in entries.values() {
            if !entry.transport.is_connected() {
                debug!(upstream = %entry.config.id, "skipping dead upstream in catalog");
                continue;
            }
            for tool in &entry.tools {
                let qualified = qualify(&entry.config.id, &tool.name);
                if self.resolver.is_tool_hidden(&qualified) {
                    continue;
                }
                let mut schema = tool.input_schema.clone();
                strip_parameters(&mut schema, &self.resolver.hidden_parameters(&qualified));
                let description = self
                    .resolver
                    .description_override(&qualified)
                    .or_else(|| tool.description.clone());
                catalog.push(McpToolDef {
                    name: qualified,
                    description,
                    input_schema: schema,
                });
            }
        }

        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Whether a live upstream currently advertises this qualified tool.
    pub async fn has_tool(&self, qualified: &str) -> bool {
        let Some((upstream_id, tool_name)) = split_qualified(qualified) else {
            return false;
        };
        let entries = self.entries.read().await;
        entries.get(upstream_id).is_some_and(|entry| {
            entry.transport.is_connected() && entry.tools.iter().any(|t| t.name == tool_name)
        })
    }

    /// Route a `tools/call` to the owning upstream.
    pub async fn call_tool(&self, qualified: &str, args: Value) -> Result<ToolCallResult, ClipError> {
        let Some((upstream_id, tool_name)) = split_qualified(qualified) else {
            return Err(ClipError::ToolNotFound(qualified.to_string()));
        };

        let transport = {
            let entries = self.entries.read().await;
            let Some(entry) = entries.get(upstream_id) else {
                return Err(ClipError::ToolNotFound(qualified.to_string()));
            };
            if !entry.tools.iter().any(|t| t.name == tool_name) {
                return Err(ClipError::ToolNotFound(qualified.to_string()));
            }
            if !entry.transport.is_connected() {
                return Err(ClipError::Upstream(format!(
                    "upstream '{upstream_id}' unavailable"
                )));
            }
            Arc::clone(&entry.transport)
        };

        let result = transport
            .request(
                "tools/call",
                Some(json!({"name": tool_name, "arguments": args})),
                self.timeouts.upstream,
            )
            .await?;
        serde_json::from_value(result).map_err(|e| {
            ClipError::Protocol(format!(
                "malformed tools/call result from '{upstream_id}': {e}"
            ))
        })
    }

    /// Forward a non-tool MCP request (resources, prompts) to the upstream
    /// that exposes it.
    ///
    /// Ownership comes from the capabilities each upstream advertised on
    /// initialize. When exactly one live upstream advertises the method's
    /// capability, the request routes there and its result or error comes
    /// back unchanged. Zero or several candidates is a not-found: guessing
    /// between upstreams could let the wrong one answer, or mask the
    /// owner's real error.
    pub async fn forward(&self, method: &str, params: Option<Value>) -> Result<Value, ClipError> {
        let capability = method.split_once('/').map_or(method, |(prefix, _)| prefix);
        let candidates: Vec<(String, Arc<dyn UpstreamTransport>)> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|e| e.transport.is_connected() && e.capabilities.get(capability).is_some())
                .map(|e| (e.config.id.clone(), Arc::clone(&e.transport)))
                .collect()
        };

        match candidates.as_slice() {
            [] => Err(ClipError::ToolNotFound(format!(
                "no upstream serves '{method}'"
            ))),
            [(upstream_id, transport)] => {
                debug!(upstream = %upstream_id, method, "forwarding to owning upstream");
                transport
                    .request(method, params, self.timeouts.upstream)
                    .await
            }
            several => {
                debug!(
                    method,
                    candidates = several.len(),
                    "refusing to pick between upstreams"
                );
                Err(ClipError::ToolNotFound(format!(
                    "multiple upstreams serve '{method}'"
                )))
            }
        }
    }

    /// Ids of upstreams whose sessions are still live.
    pub async fn live_upstreams(&self) -> Vec<String> {
        let entries = self.entries.read().await;
        let mut ids: Vec<String> = entries
            .values()
            .filter(|e| e.transport.is_connected())
            .map(|e| e.config.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close every upstream session.
    pub async fn shutdown(&self) {
        let entries = self.entries.read().await;
        for entry in entries.values() {
            info!(upstream = %entry.config.id, "closing upstream session");
            entry.transport.close().await;
        }
    }
}

/// Remove the given parameters from a JSON Schema's `properties` and
/// `required` lists.
fn strip_parameters(schema: &mut Value, hidden: &[String]) {
    if hidden.is_empty() {
        return;
    }
    if let Some(properties) = schema.get_mut("properties").and_then(Value::as_object_mut) {
        for param in hidden {
            properties.remove(param);
        }
    }
    if let Some(required) = schema.get_mut("required").and_then(Value::as_array_mut) {
        required.retain(|v| v.as_str().is_none_or(|s| !hidden.iter().any(|h| h == s)));
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use clip_types::config::ClipConfig;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// A scripted transport: canned results per method, with every call
    /// recorded for assertions.
    pub(crate) struct MockTransport {
        responses: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
        pub calls: Mutex<Vec<(String, Option<Value>)>>,
        connected: AtomicBool,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
                connected: AtomicBool::new(true),
            }
        }

        /// Queue one successful response for `method`.
        pub async fn on(&self, method: &str, result: Value) {
            self.responses
                .lock()
                .await
                .entry(method.to_string())
                .or_default()
                .push_back(Ok(result));
        }

        /// Queue one failing response for `method`.
        pub async fn on_error(&self, method: &str, message: &str) {
            self.responses
                .lock()
                .await
                .entry(method.to_string())
                .or_default()
                .push_back(Err(message.to_string()));
        }

        pub fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        pub async fn calls_for(&self, method: &str) -> Vec<Option<Value>> {
            self.calls
                .lock()
                .await
                .iter()
                .filter(|(m, _)| m == method)
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    #[async_trait]
    impl UpstreamTransport for MockTransport {
        async fn request(
            &self,
            method: &str,
            params: Option<Value>,
            _timeout: Duration,
        ) -> Result<Value, ClipError> {
            self.calls.lock().await.push((method.to_string(), params));
            let mut responses = self.responses.lock().await;
            match responses.get_mut(method).and_then(VecDeque::pop_front) {
                Some(Ok(value)) => Ok(value),
                Some(Err(message)) => Err(ClipError::Upstream(message)),
                None => Err(ClipError::Upstream(format!("no mock response for {method}"))),
            }
        }

        async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClipError> {
            self.calls.lock().await.push((method.to_string(), params));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn close(&self) {
            self.disconnect();
        }
    }

    pub(crate) fn tools_fixture() -> Value {
        json!({"tools": [
            {
                "name": "fetch",
                "description": "Fetch a URL",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string"},
                        "api_key": {"type": "string"}
                    },
                    "required": ["url", "api_key"]
                }
            },
            {
                "name": "dangerous",
                "description": "Do not expose",
                "inputSchema": {"type": "object", "properties": {}}
            }
        ]})
    }

    /// A transport pre-scripted for the handshake, advertising the full
    /// capability set.
    pub(crate) async fn handshake_transport(tools: Value) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport
            .on(
                "initialize",
                json!({"capabilities": {"tools": {}, "resources": {}, "prompts": {}}}),
            )
            .await;
        transport.on("tools/list", tools).await;
        transport
    }

    /// A transport whose upstream advertises only the tools capability.
    async fn tools_only_transport(tools: Value) -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new());
        transport
            .on("initialize", json!({"capabilities": {"tools": {}}}))
            .await;
        transport.on("tools/list", tools).await;
        transport
    }

    pub(crate) fn registry_config(config: Value) -> Arc<PolicyResolver> {
        let config: ClipConfig = serde_json::from_value(config).unwrap();
        Arc::new(PolicyResolver::new(Arc::new(config)))
    }

    fn upstream_config(id: &str) -> UpstreamConfig {
        serde_json::from_value(json!({
            "id": id, "transport": "stdio", "command": "unused"
        }))
        .unwrap()
    }

    fn default_resolver() -> Arc<PolicyResolver> {
        registry_config(json!({
            "upstreams": [{
                "id": "srv", "transport": "stdio", "command": "unused",
                "tools": {
                    "dangerous": {"hidden": true},
                    "fetch": {
                        "overwriteDescription": "Fetch, shaped",
                        "hideParameters": ["api_key"],
                        "parameterOverrides": {"api_key": "SECRET"}
                    }
                }
            }],
            "compression": {
                "enabled": false,
                "llmConfig": {"baseUrl": "http://localhost", "model": "m"}
            }
        }))
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("srv"), transport.clone())
            .await
            .unwrap();

        let calls = transport.calls.lock().await;
        let methods: Vec<&str> = calls.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(methods, vec!["initialize", "notifications/initialized", "tools/list"]);
        // The handshake identifies this proxy, not the client behind it.
        let init_params = calls[0].1.as_ref().unwrap();
        assert_eq!(init_params["clientInfo"]["name"], json!("clip"));
    }

    #[tokio::test]
    async fn test_catalog_is_qualified_and_filtered() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap();

        let tools = registry.list_tools().await;
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["srv__fetch"]);

        let fetch = &tools[0];
        assert_eq!(fetch.description.as_deref(), Some("Fetch, shaped"));
        // Hidden parameter is stripped from properties and required.
        assert!(fetch.input_schema["properties"].get("api_key").is_none());
        assert!(fetch.input_schema["properties"].get("url").is_some());
        assert_eq!(fetch.input_schema["required"], json!(["url"]));
    }

    fn two_upstream_resolver() -> Arc<PolicyResolver> {
        registry_config(json!({
            "upstreams": [
                {"id": "a", "transport": "stdio", "command": "unused"},
                {"id": "b", "transport": "stdio", "command": "unused"}
            ],
            "compression": {
                "enabled": false,
                "llmConfig": {"baseUrl": "http://localhost", "model": "m"}
            }
        }))
    }

    #[tokio::test]
    async fn test_identically_named_tools_do_not_collide() {
        let registry = UpstreamRegistry::new(two_upstream_resolver(), StageTimeouts::default());
        let tools = json!({"tools": [
            {"name": "search", "inputSchema": {"type": "object"}}
        ]});
        registry
            .add_session(upstream_config("a"), handshake_transport(tools.clone()).await)
            .await
            .unwrap();
        registry
            .add_session(upstream_config("b"), handshake_transport(tools).await)
            .await
            .unwrap();

        let names: Vec<String> = registry.list_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a__search", "b__search"]);
    }

    #[tokio::test]
    async fn test_call_tool_routes_and_unwraps() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        transport
            .on("tools/call", json!({"content": [{"type": "text", "text": "body"}]}))
            .await;
        registry
            .add_session(upstream_config("srv"), transport.clone())
            .await
            .unwrap();

        let result = registry
            .call_tool("srv__fetch", json!({"url": "u"}))
            .await
            .unwrap();
        assert_eq!(result.text_body(), "body");

        let calls = transport.calls_for("tools/call").await;
        assert_eq!(calls.len(), 1);
        let params = calls[0].as_ref().unwrap();
        // The upstream sees the bare tool name, not the qualified one.
        assert_eq!(params["name"], json!("fetch"));
        assert_eq!(params["arguments"], json!({"url": "u"}));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_upstream() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap();

        for qualified in ["srv__missing", "ghost__fetch", "not-qualified"] {
            let err = registry.call_tool(qualified, json!({})).await.unwrap_err();
            assert!(matches!(err, ClipError::ToolNotFound(_)), "{qualified}: {err:?}");
            assert!(!registry.has_tool(qualified).await);
        }
        assert!(registry.has_tool("srv__fetch").await);
    }

    #[tokio::test]
    async fn test_dead_upstream_leaves_catalog_and_fails_calls() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("srv"), transport.clone())
            .await
            .unwrap();
        assert_eq!(registry.list_tools().await.len(), 1);

        transport.disconnect();
        assert!(registry.list_tools().await.is_empty());
        assert!(registry.live_upstreams().await.is_empty());

        let err = registry
            .call_tool("srv__fetch", json!({"url": "u"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unavailable"), "got {err}");
    }

    #[tokio::test]
    async fn test_upstream_error_propagates() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        transport.on_error("tools/call", "disk on fire").await;
        registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap();

        let err = registry
            .call_tool("srv__fetch", json!({"url": "u"}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        registry
            .add_session(upstream_config("srv"), handshake_transport(tools_fixture()).await)
            .await
            .unwrap();
        let err = registry
            .add_session(upstream_config("srv"), handshake_transport(tools_fixture()).await)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_failed_handshake_does_not_register() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = Arc::new(MockTransport::new());
        transport.on_error("initialize", "refused").await;

        let err = registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert!(registry.live_upstreams().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_all_excludes_broken_upstream() {
        // A command that cannot be spawned is excluded without failing the rest.
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let broken: UpstreamConfig = serde_json::from_value(json!({
            "id": "broken", "transport": "stdio", "command": "/definitely/not/a/binary"
        }))
        .unwrap();
        registry.connect_all(&[broken]).await;
        assert!(registry.live_upstreams().await.is_empty());
    }

    #[tokio::test]
    async fn test_forward_routes_to_live_upstream() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        transport
            .on("resources/read", json!({"contents": []}))
            .await;
        registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap();

        let result = registry
            .forward("resources/read", Some(json!({"uri": "file:///x"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"contents": []}));
    }

    #[tokio::test]
    async fn test_forward_with_no_live_upstream_is_not_found() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let err = registry.forward("resources/list", None).await.unwrap_err();
        assert!(matches!(err, ClipError::ToolNotFound(_)), "got {err:?}");
        assert!(err.to_string().contains("no upstream serves"));
    }

    // Two live upstreams, one owner: the request routes to the upstream
    // that advertises the capability, and only to it.
    #[tokio::test]
    async fn test_forward_routes_to_sole_owner() {
        let registry = UpstreamRegistry::new(two_upstream_resolver(), StageTimeouts::default());
        let owner = handshake_transport(tools_fixture()).await;
        owner
            .on("resources/read", json!({"contents": ["owned"]}))
            .await;
        let bystander = tools_only_transport(json!({"tools": []})).await;
        registry
            .add_session(upstream_config("a"), owner.clone())
            .await
            .unwrap();
        registry
            .add_session(upstream_config("b"), bystander.clone())
            .await
            .unwrap();

        let result = registry
            .forward("resources/read", Some(json!({"uri": "res://a/1"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"contents": ["owned"]}));
        assert!(bystander.calls_for("resources/read").await.is_empty());
    }

    // When more than one live upstream advertises the capability there is
    // no way to know which owns the id; the request is not found and no
    // upstream is asked to guess.
    #[tokio::test]
    async fn test_forward_ambiguous_ownership_is_not_found() {
        let registry = UpstreamRegistry::new(two_upstream_resolver(), StageTimeouts::default());
        let a = handshake_transport(tools_fixture()).await;
        let b = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("a"), a.clone())
            .await
            .unwrap();
        registry
            .add_session(upstream_config("b"), b.clone())
            .await
            .unwrap();

        let err = registry
            .forward("resources/read", Some(json!({"uri": "res://a/1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ClipError::ToolNotFound(_)), "got {err:?}");
        assert!(err.to_string().contains("multiple upstreams"));
        assert!(a.calls_for("resources/read").await.is_empty());
        assert!(b.calls_for("resources/read").await.is_empty());
    }

    // The owner's real error surfaces; another upstream's unrelated
    // success must not mask it.
    #[tokio::test]
    async fn test_forward_error_from_owner_propagates() {
        let registry = UpstreamRegistry::new(two_upstream_resolver(), StageTimeouts::default());
        let owner = handshake_transport(tools_fixture()).await;
        owner.on_error("resources/read", "vault sealed").await;
        let bystander = tools_only_transport(json!({"tools": []})).await;
        // The bystander would happily answer, but must never be asked.
        bystander
            .on("resources/read", json!({"contents": ["wrong"]}))
            .await;
        registry
            .add_session(upstream_config("a"), owner)
            .await
            .unwrap();
        registry
            .add_session(upstream_config("b"), bystander.clone())
            .await
            .unwrap();

        let err = registry
            .forward("resources/read", Some(json!({"uri": "res://a/1"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("vault sealed"));
        assert!(bystander.calls_for("resources/read").await.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_tools_replaces_cached_list() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        transport
            .on(
                "tools/list",
                json!({"tools": [{"name": "brand_new", "inputSchema": {"type": "object"}}]}),
            )
            .await;
        registry
            .add_session(upstream_config("srv"), transport)
            .await
            .unwrap();

        registry.refresh_tools("srv").await.unwrap();
        let names: Vec<String> = registry.list_tools().await.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["srv__brand_new"]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_transports() {
        let registry = UpstreamRegistry::new(default_resolver(), StageTimeouts::default());
        let transport = handshake_transport(tools_fixture()).await;
        registry
            .add_session(upstream_config("srv"), transport.clone())
            .await
            .unwrap();

        registry.shutdown().await;
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_strip_parameters() {
        let mut schema = json!({
            "type": "object",
            "properties": {"a": {}, "b": {}},
            "required": ["a", "b"]
        });
        strip_parameters(&mut schema, &["b".to_string()]);
        assert!(schema["properties"].get("b").is_none());
        assert_eq!(schema["required"], json!(["a"]));

        // Schemas without properties are left alone.
        let mut bare = json!({"type": "object"});
        strip_parameters(&mut bare, &["x".to_string()]);
        assert_eq!(bare, json!({"type": "object"}));
    }
}
