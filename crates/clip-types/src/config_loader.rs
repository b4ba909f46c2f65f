/// Config file loader with validation.
///
/// Reads the JSON config from a path, parses it strictly (unknown fields are
/// rejected by the types themselves), and validates cross-field rules the
/// schema cannot express. Configs are immutable after load; there is no
/// hot-reload.
use std::path::Path;

use crate::config::{ClipConfig, TransportKind, QUALIFIER};
use crate::errors::ClipError;

/// Load and validate a config file.
pub fn load(path: &Path) -> Result<ClipConfig, ClipError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ClipError::Config(format!("failed to read {}: {e}", path.display())))?;
    let config: ClipConfig = serde_json::from_str(&content)
        .map_err(|e| ClipError::Config(format!("failed to parse {}: {e}", path.display())))?;
    validate(&config)?;
    Ok(config)
}

/// Validate rules the serde schema cannot express.
pub fn validate(config: &ClipConfig) -> Result<(), ClipError> {
    let mut seen = std::collections::BTreeSet::new();
    for upstream in &config.upstreams {
        if upstream.id.is_empty() {
            return Err(ClipError::Config("upstream id must not be empty".into()));
        }
        if upstream.id.contains(QUALIFIER) {
            return Err(ClipError::Config(format!(
                "upstream id '{}' contains the reserved separator '{QUALIFIER}'",
                upstream.id
            )));
        }
        if !seen.insert(upstream.id.as_str()) {
            return Err(ClipError::Config(format!(
                "duplicate upstream id '{}'",
                upstream.id
            )));
        }

        match upstream.transport {
            TransportKind::Stdio => {
                if upstream.command.as_deref().unwrap_or("").is_empty() {
                    return Err(ClipError::Config(format!(
                        "upstream '{}' uses stdio transport but has no command",
                        upstream.id
                    )));
                }
            }
            TransportKind::Sse => {
                if upstream.url.as_deref().unwrap_or("").is_empty() {
                    return Err(ClipError::Config(format!(
                        "upstream '{}' uses sse transport but has no url",
                        upstream.id
                    )));
                }
            }
        }

        for (tool_name, tool) in &upstream.tools {
            if tool_name.contains(QUALIFIER) {
                return Err(ClipError::Config(format!(
                    "tool name '{tool_name}' on upstream '{}' contains the reserved separator '{QUALIFIER}'",
                    upstream.id
                )));
            }
            // A hidden parameter can no longer be supplied by the client,
            // so an override must exist for it.
            if let Some(hidden) = &tool.hide_parameters {
                for param in hidden {
                    let has_override = tool
                        .parameter_overrides
                        .as_ref()
                        .is_some_and(|o| o.contains_key(param));
                    if !has_override {
                        return Err(ClipError::Config(format!(
                            "tool '{tool_name}' on upstream '{}' hides parameter '{param}' without a parameterOverrides value",
                            upstream.id
                        )));
                    }
                }
            }
            if let Some(c) = &tool.compression {
                if c.token_threshold == Some(0) {
                    return Err(ClipError::Config(format!(
                        "tool '{tool_name}' on upstream '{}' sets tokenThreshold to 0",
                        upstream.id
                    )));
                }
                if c.max_output_tokens == Some(0) {
                    return Err(ClipError::Config(format!(
                        "tool '{tool_name}' on upstream '{}' sets maxOutputTokens to 0",
                        upstream.id
                    )));
                }
            }
        }
    }

    if config.compression.token_threshold == 0 {
        return Err(ClipError::Config("compression.tokenThreshold must be > 0".into()));
    }
    if config.compression.max_output_tokens == 0 {
        return Err(ClipError::Config("compression.maxOutputTokens must be > 0".into()));
    }
    if let Some(esc) = &config.compression.retry_escalation {
        if esc.enabled && esc.token_multiplier < 1.0 {
            return Err(ClipError::Config(
                "retryEscalation.tokenMultiplier must be >= 1.0".into(),
            ));
        }
        if esc.enabled && esc.window_seconds == 0 {
            return Err(ClipError::Config(
                "retryEscalation.windowSeconds must be > 0".into(),
            ));
        }
    }

    Ok(())
}

/// A commented starter configuration, written by `clip --init`.
pub fn example() -> &'static str {
    r#"{
  "upstreams": [
    {
      "id": "files",
      "name": "Filesystem tools",
      "transport": "stdio",
      "command": "my-files-mcp",
      "args": ["--root", "/data"],
      "tools": {
        "read_file": {
          "cache": { "enabled": true, "ttlSeconds": 120 }
        },
        "delete_file": { "hidden": true }
      }
    },
    {
      "id": "web",
      "transport": "sse",
      "url": "http://localhost:8931/mcp",
      "defaults": {
        "compression": { "enabled": true, "tokenThreshold": 2000 }
      },
      "tools": {
        "fetch": {
          "hideParameters": ["api_key"],
          "parameterOverrides": { "api_key": "CHANGE_ME" }
        }
      }
    }
  ],
  "compression": {
    "enabled": true,
    "tokenThreshold": 1000,
    "maxOutputTokens": 500,
    "bypassEnabled": true,
    "retryEscalation": {
      "enabled": true,
      "windowSeconds": 60,
      "tokenMultiplier": 2.0
    },
    "llmConfig": {
      "baseUrl": "http://localhost:8000/v1",
      "model": "summarizer-small"
    }
  },
  "masking": {
    "enabled": false
  },
  "defaults": {
    "cache": { "enabled": true, "ttlSeconds": 300 }
  },
  "logging": { "level": "info" }
}
"#
}
