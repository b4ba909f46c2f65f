/// Response shaping for the CLIP proxy.
///
/// Everything that happens to a tool response between the upstream and the
/// client lives here:
/// - **Cache**: keyed store of shaped responses with single-flight builders
/// - **Masker**: regex-based PII redaction with an optional LLM fallback
/// - **Summarizer**: LLM-backed compression of oversized responses
/// - **Escalation**: budget enlargement for repeated identical calls
/// - **Tokens**: the deterministic size estimate the decisions are based on
pub mod cache;
pub mod escalation;
pub mod llm;
pub mod masker;
pub mod summarizer;
pub mod tokens;

pub use cache::{cache_key, canonical_json, CacheLookup, ResponseCache};
pub use escalation::EscalationTracker;
pub use llm::OpenAiClient;
pub use masker::{MaskOutcome, PiiMasker};
pub use summarizer::{Summarizer, Summary};
pub use tokens::estimate_tokens;
