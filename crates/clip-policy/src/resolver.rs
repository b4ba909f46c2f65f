//! Per-tool policy resolution.
//!
//! The config is a fixed three-level tree (global → upstream → tool). For
//! every policy record the effective value of a field is the most specific
//! layer that set it, falling back to built-in defaults. The merge is a
//! fixed-depth field-wise lookup; there is no recursion and no possibility
//! of cyclic inheritance.
//!
//! `piiTypes` and individual `parameterOverrides` values are replaced
//! wholesale by the layer that sets them, never unioned.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use clip_types::config::{
    CachePolicy, ClipConfig, CompressionOverride, CompressionPolicy, MaskingOverride,
    MaskingPolicy, RetryEscalation, ScopeDefaults, ToolConfig, UpstreamConfig,
    DEFAULT_ESCALATION_LEVELS, QUALIFIER,
};

/// Split a qualified tool name into `(upstream_id, tool_name)`.
///
/// The separator is reserved, so the first occurrence is the boundary.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    let idx = qualified.find(QUALIFIER)?;
    let (upstream, rest) = qualified.split_at(idx);
    let tool = &rest[QUALIFIER.len()..];
    if upstream.is_empty() || tool.is_empty() {
        return None;
    }
    Some((upstream, tool))
}

/// Join an upstream id and a tool name into a qualified tool name.
pub fn qualify(upstream_id: &str, tool_name: &str) -> String {
    format!("{upstream_id}{QUALIFIER}{tool_name}")
}

/// Resolves effective per-tool policies from the immutable config tree.
///
/// For a qualified name that matches no configured upstream or tool, the
/// queries return the layered defaults (or empties) rather than erroring;
/// existence is enforced by the catalog, not here.
pub struct PolicyResolver {
    config: Arc<ClipConfig>,
}

impl PolicyResolver {
    pub fn new(config: Arc<ClipConfig>) -> Self {
        Self { config }
    }

    fn upstream(&self, id: &str) -> Option<&UpstreamConfig> {
        self.config.upstreams.iter().find(|u| u.id == id)
    }

    /// The (tool, upstream-defaults) layers for a qualified name, where known.
    fn layers(&self, qualified: &str) -> (Option<&ToolConfig>, Option<&ScopeDefaults>) {
        let Some((upstream_id, tool_name)) = split_qualified(qualified) else {
            return (None, None);
        };
        let Some(upstream) = self.upstream(upstream_id) else {
            return (None, None);
        };
        (upstream.tools.get(tool_name), upstream.defaults.as_ref())
    }

    /// Effective compression policy for a qualified tool name.
    pub fn resolve_compression_policy(&self, qualified: &str) -> CompressionPolicy {
        let mut policy = CompressionPolicy::builtin();

        // Global layer: the compression section carries the global values,
        // refined by the optional defaults block.
        let section = &self.config.compression;
        policy.enabled = section.enabled;
        policy.token_threshold = section.token_threshold;
        policy.max_output_tokens = section.max_output_tokens;
        if let Some(defaults) = self.config.defaults.as_ref().and_then(|d| d.compression.as_ref()) {
            apply_compression(&mut policy, defaults);
        }

        let (tool, upstream_defaults) = self.layers(qualified);
        if let Some(o) = upstream_defaults.and_then(|d| d.compression.as_ref()) {
            apply_compression(&mut policy, o);
        }
        if let Some(o) = tool.and_then(|t| t.compression.as_ref()) {
            apply_compression(&mut policy, o);
        }
        policy
    }

    /// Effective masking policy for a qualified tool name.
    pub fn resolve_masking_policy(&self, qualified: &str) -> MaskingPolicy {
        let mut policy = MaskingPolicy::builtin();

        if let Some(section) = &self.config.masking {
            policy.enabled = section.enabled;
        }
        if let Some(defaults) = self.config.defaults.as_ref().and_then(|d| d.masking.as_ref()) {
            apply_masking(&mut policy, defaults);
        }

        let (tool, upstream_defaults) = self.layers(qualified);
        if let Some(o) = upstream_defaults.and_then(|d| d.masking.as_ref()) {
            apply_masking(&mut policy, o);
        }
        if let Some(o) = tool.and_then(|t| t.masking.as_ref()) {
            apply_masking(&mut policy, o);
        }
        policy
    }

    /// Effective cache policy for a qualified tool name.
    pub fn resolve_cache_policy(&self, qualified: &str) -> CachePolicy {
        let mut policy = CachePolicy::builtin();

        if let Some(defaults) = self.config.defaults.as_ref().and_then(|d| d.cache.as_ref()) {
            if let Some(enabled) = defaults.enabled {
                policy.enabled = enabled;
            }
            if let Some(ttl) = defaults.ttl_seconds {
                policy.ttl_seconds = ttl;
            }
        }

        let (tool, upstream_defaults) = self.layers(qualified);
        for layer in [
            upstream_defaults.and_then(|d| d.cache.as_ref()),
            tool.and_then(|t| t.cache.as_ref()),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(enabled) = layer.enabled {
                policy.enabled = enabled;
            }
            if let Some(ttl) = layer.ttl_seconds {
                policy.ttl_seconds = ttl;
            }
        }
        policy
    }

    /// Parameters stripped from the advertised schema and from client args.
    pub fn hidden_parameters(&self, qualified: &str) -> Vec<String> {
        let (tool, _) = self.layers(qualified);
        tool.and_then(|t| t.hide_parameters.clone()).unwrap_or_default()
    }

    /// Values that replace whatever the client sent for these keys.
    pub fn parameter_overrides(&self, qualified: &str) -> BTreeMap<String, Value> {
        let (tool, _) = self.layers(qualified);
        tool.and_then(|t| t.parameter_overrides.clone()).unwrap_or_default()
    }

    /// Whether the tool is hidden from the catalog entirely.
    pub fn is_tool_hidden(&self, qualified: &str) -> bool {
        let (tool, _) = self.layers(qualified);
        tool.and_then(|t| t.hidden).unwrap_or(false)
    }

    /// Replacement description for the advertised catalog, if configured.
    pub fn description_override(&self, qualified: &str) -> Option<String> {
        let (tool, _) = self.layers(qualified);
        tool.and_then(|t| t.overwrite_description.clone())
    }

    /// Whether goal-aware summarization is enabled for this tool.
    pub fn is_goal_aware_enabled(&self, qualified: &str) -> bool {
        self.resolve_compression_policy(qualified).goal_aware
    }

    /// Global retry-escalation settings, when configured and enabled.
    pub fn retry_escalation(&self) -> Option<RetryEscalation> {
        let c = self.config.compression.retry_escalation.as_ref()?;
        if !c.enabled {
            return None;
        }
        Some(RetryEscalation {
            enabled: true,
            window_seconds: c.window_seconds,
            token_multiplier: c.token_multiplier,
            max_levels: c.max_levels.unwrap_or(DEFAULT_ESCALATION_LEVELS),
        })
    }

    /// Whether clients may skip the cache per call.
    pub fn is_bypass_enabled(&self) -> bool {
        self.config.compression.bypass_enabled.unwrap_or(false)
    }
}

fn apply_compression(policy: &mut CompressionPolicy, layer: &CompressionOverride) {
    if let Some(enabled) = layer.enabled {
        policy.enabled = enabled;
    }
    if let Some(threshold) = layer.token_threshold {
        policy.token_threshold = threshold;
    }
    if let Some(max) = layer.max_output_tokens {
        policy.max_output_tokens = max;
    }
    if let Some(instructions) = &layer.custom_instructions {
        policy.custom_instructions = Some(instructions.clone());
    }
    if let Some(goal_aware) = layer.goal_aware {
        policy.goal_aware = goal_aware;
    }
}

fn apply_masking(policy: &mut MaskingPolicy, layer: &MaskingOverride) {
    if let Some(enabled) = layer.enabled {
        policy.enabled = enabled;
    }
    if let Some(types) = &layer.pii_types {
        // Replaced, not unioned.
        policy.pii_types = types.clone();
    }
    if let Some(fallback) = layer.llm_fallback {
        policy.llm_fallback = fallback;
    }
    if let Some(threshold) = layer.llm_fallback_threshold {
        policy.llm_fallback_threshold = threshold;
    }
}
