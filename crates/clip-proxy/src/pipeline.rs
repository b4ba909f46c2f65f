//! The per-call shaping pipeline.
//!
//! Every `tools/call` runs the same fixed sequence:
//!
//! 1. Visibility — unknown or hidden tools fail as if they never existed
//! 2. Parameter policy — hidden parameters stripped, overrides merged
//! 3. Cache lookup keyed over the post-override arguments
//! 4. Single-flight builder around stages 5-9:
//! 5. Upstream call (errors propagate, nothing negative is cached)
//! 6. PII masking (failures degrade to unmasked output)
//! 7. Compression decision against the estimated token count
//! 8. Summarization with the escalation-adjusted budget (failures degrade
//!    to the masked original, annotated with the reason)
//! 9. Escalation bookkeeping and shaping annotations
//! 10. Return; the cache write is part of single-flight completion
//!
//! The cache sits in front of masking and compression so the cached
//! artifact is already shaped and repeat calls skip both. A policy change
//! does not retroactively reshape cached entries.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use clip_policy::PolicyResolver;
use clip_shaping::{cache_key, estimate_tokens, EscalationTracker, PiiMasker, ResponseCache, Summarizer};
use clip_types::config::BYPASS_ARGUMENT;
use clip_types::{ClipError, ContentItem, ShapingMeta, ToolCallResult};

use crate::upstream::UpstreamRegistry;

/// Orchestrates the shaping stages for every tool call.
pub struct CallPipeline {
    registry: Arc<UpstreamRegistry>,
    resolver: Arc<PolicyResolver>,
    cache: ResponseCache<ToolCallResult>,
    masker: Arc<PiiMasker>,
    summarizer: Arc<Summarizer>,
    escalation: Arc<EscalationTracker>,
}

impl Clone for CallPipeline {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            resolver: Arc::clone(&self.resolver),
            cache: self.cache.clone(),
            masker: Arc::clone(&self.masker),
            summarizer: Arc::clone(&self.summarizer),
            escalation: Arc::clone(&self.escalation),
        }
    }
}

impl CallPipeline {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        resolver: Arc<PolicyResolver>,
        cache: ResponseCache<ToolCallResult>,
        masker: Arc<PiiMasker>,
        summarizer: Arc<Summarizer>,
        escalation: Arc<EscalationTracker>,
    ) -> Self {
        Self {
            registry,
            resolver,
            cache,
            masker,
            summarizer,
            escalation,
        }
    }

    /// Run one `tools/call` through the full pipeline.
    pub async fn handle_call(
        &self,
        qualified: &str,
        args: Value,
        goal: Option<String>,
    ) -> Result<ToolCallResult, ClipError> {
        // A hidden tool behaves exactly like a nonexistent one.
        if self.resolver.is_tool_hidden(qualified) || !self.registry.has_tool(qualified).await {
            return Err(ClipError::ToolNotFound(qualified.to_string()));
        }

        let mut args = into_object(args)?;

        // The bypass key is reserved: always stripped, honored only when
        // the config allows it.
        let bypass_requested = args
            .remove(BYPASS_ARGUMENT)
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let bypass = bypass_requested && self.resolver.is_bypass_enabled();

        // Hidden parameters should not have been sent; overrides win over
        // whatever the client supplied.
        for param in self.resolver.hidden_parameters(qualified) {
            args.remove(&param);
        }
        for (key, value) in self.resolver.parameter_overrides(qualified) {
            args.insert(key, value);
        }
        let args = Value::Object(args);

        let key = cache_key(qualified, &args);
        let cache_policy = self.resolver.resolve_cache_policy(qualified);

        if !cache_policy.enabled || bypass {
            if bypass {
                debug!(tool = %qualified, "cache bypass requested, skipping read and write");
            }
            return self.shape_call(qualified, args, &key, goal.as_deref()).await;
        }

        let ttl = std::time::Duration::from_secs(cache_policy.ttl_seconds);
        let builder = {
            let pipeline = self.clone();
            let qualified = qualified.to_string();
            let args = args.clone();
            let key = key.clone();
            move || async move {
                pipeline
                    .shape_call(&qualified, args, &key, goal.as_deref())
                    .await
            }
        };

        let lookup = self.cache.get_or_compute(&key, ttl, builder).await?;
        let mut result = lookup.value;
        if lookup.hit {
            if let Some(mut shaping) = result.shaping() {
                shaping.cache_hit = true;
                result.set_shaping(&shaping);
            }
            debug!(tool = %qualified, "served from cache");
        }
        Ok(result)
    }

    /// Stages 5-9: upstream call, masking, compression, annotations.
    async fn shape_call(
        &self,
        qualified: &str,
        args: Value,
        key: &str,
        goal: Option<&str>,
    ) -> Result<ToolCallResult, ClipError> {
        let mut result = self.registry.call_tool(qualified, args).await?;

        let masking = self.resolver.resolve_masking_policy(qualified);
        let masked_count = if masking.enabled {
            self.masker.mask_result(&mut result, &masking).await
        } else {
            0
        };

        let body = result.text_body();
        let original_tokens = estimate_tokens(&body);
        let compression = self.resolver.resolve_compression_policy(qualified);
        let factor = self.escalation.register(key).await;

        let mut shaping = ShapingMeta {
            compressed: false,
            original_tokens,
            summary_tokens: None,
            masked_count,
            compression_error: None,
            cache_hit: false,
            shaped_at: Utc::now(),
        };

        if compression.enabled && !body.is_empty() && original_tokens >= compression.token_threshold
        {
            let budget = ((compression.max_output_tokens as f64) * factor).round() as u32;
            match self
                .summarizer
                .summarize(&body, &compression, budget, goal)
                .await
            {
                Ok(summary) => {
                    debug!(
                        tool = %qualified,
                        original_tokens,
                        summary_tokens = summary.summary_tokens,
                        budget,
                        "response compressed"
                    );
                    // Non-text entries pass through; the text entries are
                    // replaced by one summary entry.
                    result.content.retain(|c| c.as_text().is_none());
                    result.content.push(ContentItem::text(summary.text));
                    shaping.compressed = true;
                    shaping.summary_tokens = Some(summary.summary_tokens);
                }
                Err(e) => {
                    // Serve the masked original rather than failing the call.
                    warn!(tool = %qualified, error = %e, "summarization failed, returning uncompressed response");
                    shaping.compression_error = Some(e.to_string());
                }
            }
        }

        result.set_shaping(&shaping);
        Ok(result)
    }
}

fn into_object(args: Value) -> Result<Map<String, Value>, ClipError> {
    match args {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ClipError::Protocol(format!(
            "tool arguments must be an object, got {other}"
        ))),
    }
}
