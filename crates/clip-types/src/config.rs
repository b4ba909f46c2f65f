/// Configuration types for the CLIP proxy.
///
/// The configuration file is a three-level tree: global sections, per-upstream
/// defaults, and per-tool overrides. Each layer is a partial record (all
/// fields optional); the policy resolver merges the layers into the fully
/// resolved structs at the bottom of this file. Configs are immutable after
/// load.
///
/// Unknown fields are rejected everywhere so a typo in the file fails fast
/// instead of silently falling back to defaults.
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The separator between an upstream id and a tool name in a qualified
/// tool name. Reserved: neither side may contain it.
pub const QUALIFIER: &str = "__";

/// Reserved `tools/call` argument key that requests a cache bypass for a
/// single call. Always stripped before hashing and upstream dispatch.
pub const BYPASS_ARGUMENT: &str = "__clip_bypass_cache";

// ============================================================
// Top-level configuration
// ============================================================

/// Top-level configuration, parsed from the JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ClipConfig {
    /// Upstream MCP servers to proxy.
    pub upstreams: Vec<UpstreamConfig>,
    /// Global compression settings and the summarizer LLM endpoint.
    pub compression: CompressionSection,
    /// Global masking settings and the optional masker-fallback LLM endpoint.
    #[serde(default)]
    pub masking: Option<MaskingSection>,
    /// Global policy defaults, overridable per upstream and per tool.
    #[serde(default)]
    pub defaults: Option<ScopeDefaults>,
    /// Stage timeouts for external calls.
    #[serde(default)]
    pub timeouts: Option<TimeoutsConfig>,
    /// Logging settings.
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

/// Global compression section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CompressionSection {
    /// Whether compression is enabled by default.
    pub enabled: bool,
    /// Estimated-token size above which a response becomes a summarization
    /// candidate.
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u32,
    /// Upper bound on summary length, in tokens.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Temporary budget enlargement for repeated identical calls.
    #[serde(default)]
    pub retry_escalation: Option<RetryEscalationConfig>,
    /// Whether clients may skip the cache per call via the reserved
    /// bypass argument.
    #[serde(default)]
    pub bypass_enabled: Option<bool>,
    /// The summarizer LLM endpoint.
    #[serde(rename = "llmConfig")]
    pub llm: LlmConfig,
}

/// Global masking section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MaskingSection {
    /// Whether masking is enabled by default.
    pub enabled: bool,
    /// Optional LLM endpoint for the fallback extraction pass.
    #[serde(default, rename = "llmConfig")]
    pub llm: Option<LlmConfig>,
}

/// An OpenAI-style chat-completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LlmConfig {
    /// Base URL, e.g. `https://api.example.com/v1`.
    pub base_url: String,
    /// Model identifier sent in the request body.
    pub model: String,
    /// Bearer token, if the endpoint requires one.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// Retry-escalation settings (global only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryEscalationConfig {
    /// Whether escalation is active.
    pub enabled: bool,
    /// Window within which identical calls count as repeats.
    pub window_seconds: u64,
    /// Budget multiplier compounded per repeat.
    pub token_multiplier: f64,
    /// Cap on the compounding exponent.
    #[serde(default)]
    pub max_levels: Option<u32>,
}

/// Stage timeouts, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct TimeoutsConfig {
    #[serde(default)]
    pub upstream_seconds: Option<u64>,
    #[serde(default)]
    pub summarizer_seconds: Option<u64>,
    #[serde(default)]
    pub masker_seconds: Option<u64>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Filter directive, e.g. `"info"` or `"clip_proxy=debug"`.
    #[serde(default)]
    pub level: Option<String>,
}

// ============================================================
// Upstream and tool layers
// ============================================================

/// Transport used to reach an upstream MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// Streamable HTTP endpoint with SSE responses.
    Sse,
}

/// Configuration for one upstream MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Unique id; becomes the prefix of every qualified tool name.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Transport kind.
    pub transport: TransportKind,
    /// Command to spawn (stdio transport).
    #[serde(default)]
    pub command: Option<String>,
    /// Arguments for the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Endpoint URL (sse transport).
    #[serde(default)]
    pub url: Option<String>,
    /// Upstream-level policy defaults.
    #[serde(default)]
    pub defaults: Option<ScopeDefaults>,
    /// Per-tool overrides, keyed by unqualified tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
}

/// Policy defaults attachable at the global or upstream scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ScopeDefaults {
    #[serde(default)]
    pub compression: Option<CompressionOverride>,
    #[serde(default)]
    pub masking: Option<MaskingOverride>,
    #[serde(default)]
    pub cache: Option<CacheOverride>,
}

/// Per-tool configuration. All fields optional; absent means inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ToolConfig {
    /// Hide this tool entirely: absent from the catalog, calls fail as if
    /// it never existed.
    #[serde(default)]
    pub hidden: Option<bool>,
    /// Replace the upstream's tool description in the advertised catalog.
    #[serde(default)]
    pub overwrite_description: Option<String>,
    /// Parameters stripped from the advertised schema and from client args.
    /// Each entry must have a matching `parameterOverrides` value, since the
    /// client can no longer supply one.
    #[serde(default)]
    pub hide_parameters: Option<Vec<String>>,
    /// Values that replace whatever the client sent for these keys.
    #[serde(default)]
    pub parameter_overrides: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub compression: Option<CompressionOverride>,
    #[serde(default)]
    pub masking: Option<MaskingOverride>,
    #[serde(default)]
    pub cache: Option<CacheOverride>,
}

/// Partial compression record for one layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CompressionOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub token_threshold: Option<u32>,
    #[serde(default)]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub custom_instructions: Option<String>,
    #[serde(default)]
    pub goal_aware: Option<bool>,
}

/// Partial masking record for one layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MaskingOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replaced wholesale by the most specific layer that sets it, never
    /// unioned across layers.
    #[serde(default)]
    pub pii_types: Option<BTreeSet<PiiType>>,
    #[serde(default)]
    pub llm_fallback: Option<bool>,
    #[serde(default)]
    pub llm_fallback_threshold: Option<FallbackThreshold>,
}

/// Partial cache record for one layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CacheOverride {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// The closed set of PII kinds the masker recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiType {
    Email,
    Ssn,
    Phone,
    CreditCard,
    IpAddress,
}

impl PiiType {
    /// All recognized PII kinds.
    pub fn all() -> BTreeSet<PiiType> {
        [
            PiiType::Email,
            PiiType::Ssn,
            PiiType::Phone,
            PiiType::CreditCard,
            PiiType::IpAddress,
        ]
        .into_iter()
        .collect()
    }
}

/// Confidence bar below which the masker's LLM fallback pass kicks in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackThreshold {
    Low,
    Medium,
    High,
}

// ============================================================
// Resolved policies
// ============================================================

/// Fully resolved compression policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub token_threshold: u32,
    pub max_output_tokens: u32,
    pub custom_instructions: Option<String>,
    pub goal_aware: bool,
}

/// Fully resolved masking policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct MaskingPolicy {
    pub enabled: bool,
    pub pii_types: BTreeSet<PiiType>,
    pub llm_fallback: bool,
    pub llm_fallback_threshold: FallbackThreshold,
}

/// Fully resolved cache policy for one tool.
#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_seconds: u64,
}

/// Resolved retry-escalation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryEscalation {
    pub enabled: bool,
    pub window_seconds: u64,
    pub token_multiplier: f64,
    pub max_levels: u32,
}

/// Resolved stage timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub upstream: Duration,
    pub summarizer: Duration,
    pub masker: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            upstream: Duration::from_secs(60),
            summarizer: Duration::from_secs(30),
            masker: Duration::from_secs(15),
        }
    }
}

impl StageTimeouts {
    /// Resolve from the optional config section.
    pub fn from_config(config: Option<&TimeoutsConfig>) -> Self {
        let defaults = Self::default();
        match config {
            None => defaults,
            Some(t) => Self {
                upstream: t
                    .upstream_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.upstream),
                summarizer: t
                    .summarizer_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.summarizer),
                masker: t
                    .masker_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.masker),
            },
        }
    }
}

// ============================================================
// Built-in defaults
// ============================================================

fn default_token_threshold() -> u32 {
    1000
}

fn default_max_output_tokens() -> u32 {
    500
}

/// Default cap on the escalation exponent.
pub const DEFAULT_ESCALATION_LEVELS: u32 = 3;

impl CompressionPolicy {
    /// Built-in defaults used when no layer sets a field.
    pub fn builtin() -> Self {
        Self {
            enabled: false,
            token_threshold: default_token_threshold(),
            max_output_tokens: default_max_output_tokens(),
            custom_instructions: None,
            goal_aware: false,
        }
    }
}

impl MaskingPolicy {
    /// Built-in defaults used when no layer sets a field.
    pub fn builtin() -> Self {
        Self {
            enabled: false,
            pii_types: PiiType::all(),
            llm_fallback: false,
            llm_fallback_threshold: FallbackThreshold::Medium,
        }
    }
}

impl CachePolicy {
    /// Built-in defaults used when no layer sets a field.
    pub fn builtin() -> Self {
        Self {
            enabled: false,
            ttl_seconds: 300,
        }
    }
}
