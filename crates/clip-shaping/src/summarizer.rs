//! LLM-backed response summarization.
//!
//! Given a large tool response and a resolved compression policy, produce a
//! compact replacement body. The summarizer fails upward; the call pipeline
//! decides whether to serve the uncompressed original or surface the error.

use std::sync::Arc;

use clip_types::config::CompressionPolicy;
use clip_types::traits::{ChatCompletionClient, ChatRequest};
use clip_types::ClipError;

use crate::tokens::estimate_tokens;

/// A produced summary with token accounting.
#[derive(Debug, Clone)]
pub struct Summary {
    /// The replacement text.
    pub text: String,
    /// Estimated tokens of the original body.
    pub original_tokens: u32,
    /// Estimated tokens of the summary.
    pub summary_tokens: u32,
}

const SYSTEM_PROMPT: &str = "You condense verbose tool output for an AI agent. \
Preserve every fact, identifier, number, and error message that could matter to \
the agent; drop boilerplate, markup, and repetition. Respond with the condensed \
text only, no preamble.";

/// Summarizes tool responses through a chat-completions endpoint.
pub struct Summarizer {
    client: Arc<dyn ChatCompletionClient>,
}

impl Summarizer {
    pub fn new(client: Arc<dyn ChatCompletionClient>) -> Self {
        Self { client }
    }

    /// Summarize `body` within `max_output_tokens`.
    ///
    /// `max_output_tokens` is the escalation-adjusted budget, which may
    /// exceed the policy's base value. The goal, when supplied and the
    /// policy is goal-aware, steers the summary toward what the caller is
    /// actually after.
    pub async fn summarize(
        &self,
        body: &str,
        policy: &CompressionPolicy,
        max_output_tokens: u32,
        goal: Option<&str>,
    ) -> Result<Summary, ClipError> {
        let mut prompt = String::new();
        if let Some(instructions) = &policy.custom_instructions {
            prompt.push_str("Instructions: ");
            prompt.push_str(instructions);
            prompt.push_str("\n\n");
        }
        if policy.goal_aware {
            if let Some(goal) = goal {
                prompt.push_str("The caller's goal: ");
                prompt.push_str(goal);
                prompt.push_str("\n\n");
            }
        }
        prompt.push_str(&format!(
            "Keep the result under {max_output_tokens} tokens.\n\nTool output:\n{body}"
        ));

        let response = self
            .client
            .complete(ChatRequest {
                system: SYSTEM_PROMPT.to_string(),
                user: prompt,
                max_tokens: max_output_tokens,
            })
            .await
            .map_err(|e| ClipError::Summarizer(e.to_string()))?;

        let text = response.content.trim().to_string();
        if text.is_empty() {
            return Err(ClipError::Summarizer("model returned an empty summary".to_string()));
        }

        Ok(Summary {
            original_tokens: estimate_tokens(body),
            summary_tokens: estimate_tokens(&text),
            text,
        })
    }
}
