//! PII masking.
//!
//! Regex-based detection per configured PII type, with post-match validators
//! to cut false positives (Luhn for card numbers, SSA rules for SSNs, octet
//! ranges for IP addresses). Matches are replaced by a fixed token per type,
//! so for the same input and policy the output is byte-identical.
//!
//! When the policy enables the LLM fallback and the regex pass's confidence
//! for the enabled types sits below the configured threshold, a second
//! extraction pass asks an LLM for additional spans. Any failure in that
//! pass degrades to the regex-only output with a warning — masking never
//! fails a call.

use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use clip_types::config::{FallbackThreshold, MaskingPolicy, PiiType};
use clip_types::traits::{ChatCompletionClient, ChatRequest};
use clip_types::{ContentItem, ToolCallResult};

/// A PII pattern definition with its compiled regex.
struct PiiPattern {
    kind: PiiType,
    regex: Regex,
    /// Base confidence of the regex for this type (0.0 to 1.0).
    confidence: f64,
    /// Optional post-match validator for reducing false positives.
    validator: Option<fn(&str) -> bool>,
}

/// A detected PII span.
struct Detection {
    kind: PiiType,
    offset: usize,
    length: usize,
}

/// Result of masking one text blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskOutcome {
    /// The text with detected spans replaced by redaction tokens.
    pub text: String,
    /// Number of replacements performed.
    pub replacements: u32,
}

/// Replacement token for a PII type.
fn redaction_token(kind: PiiType) -> &'static str {
    match kind {
        PiiType::Email => "[REDACTED_EMAIL]",
        PiiType::Ssn => "[REDACTED_SSN]",
        PiiType::Phone => "[REDACTED_PHONE]",
        PiiType::CreditCard => "[REDACTED_CREDIT_CARD]",
        PiiType::IpAddress => "[REDACTED_IP_ADDRESS]",
    }
}

/// Token used for spans found only by the LLM fallback pass.
const FALLBACK_TOKEN: &str = "[REDACTED_PII]";

/// Pattern-based PII masker.
///
/// All regexes are compiled once at construction and reused for every scan.
pub struct PiiMasker {
    patterns: Vec<PiiPattern>,
    fallback: Option<Arc<dyn ChatCompletionClient>>,
}

impl PiiMasker {
    /// Create a masker with no LLM fallback.
    pub fn new() -> Self {
        Self::with_fallback(None)
    }

    /// Create a masker with an optional LLM fallback client.
    pub fn with_fallback(fallback: Option<Arc<dyn ChatCompletionClient>>) -> Self {
        let patterns = vec![
            PiiPattern {
                kind: PiiType::Email,
                regex: compile_regex(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}"),
                confidence: 0.95,
                validator: None,
            },
            // US Social Security Numbers: XXX-XX-XXXX with SSA area rules.
            PiiPattern {
                kind: PiiType::Ssn,
                regex: compile_regex(r"\b\d{3}-\d{2}-\d{4}\b"),
                confidence: 0.85,
                validator: Some(ssn_validate),
            },
            // NANP-style phone numbers; separators required between groups.
            PiiPattern {
                kind: PiiType::Phone,
                regex: compile_regex(r"(?:\+1[ .\-]?)?\(?\b\d{3}\)?[ .\-]\d{3}[ .\-]\d{4}\b"),
                confidence: 0.70,
                validator: None,
            },
            // 13-19 digit sequences (optionally separated), Luhn-checked.
            PiiPattern {
                kind: PiiType::CreditCard,
                regex: compile_regex(r"\b(?:\d[ \-]?){12,18}\d\b"),
                confidence: 0.70,
                validator: Some(luhn_check),
            },
            PiiPattern {
                kind: PiiType::IpAddress,
                regex: compile_regex(r"\b(?:\d{1,3}\.){3}\d{1,3}\b"),
                confidence: 0.90,
                validator: Some(ipv4_octets_valid),
            },
        ];

        Self { patterns, fallback }
    }

    /// Scan `content` for the policy's enabled PII types.
    fn scan(&self, content: &str, policy: &MaskingPolicy) -> Vec<Detection> {
        let mut detections = Vec::new();

        for pattern in &self.patterns {
            if !policy.pii_types.contains(&pattern.kind) {
                continue;
            }
            for mat in pattern.regex.find_iter(content) {
                if let Some(validator) = pattern.validator {
                    if !validator(mat.as_str()) {
                        continue;
                    }
                }
                debug!(
                    kind = ?pattern.kind,
                    offset = mat.start(),
                    length = mat.len(),
                    "PII detected"
                );
                detections.push(Detection {
                    kind: pattern.kind,
                    offset: mat.start(),
                    length: mat.len(),
                });
            }
        }

        // Sorted by offset for deterministic, splice-friendly output. The
        // sort is stable, so ties keep pattern-table order.
        detections.sort_by_key(|d| d.offset);
        detections
    }

    /// Regex-only masking pass. Deterministic for a given input and policy.
    pub fn mask_text(&self, content: &str, policy: &MaskingPolicy) -> MaskOutcome {
        let detections = self.scan(content, policy);
        if detections.is_empty() {
            return MaskOutcome {
                text: content.to_string(),
                replacements: 0,
            };
        }

        let mut result = String::with_capacity(content.len());
        let mut replacements = 0u32;
        let mut last_end = 0;

        for detection in &detections {
            // Skip spans already covered by a previous replacement.
            if detection.offset < last_end {
                continue;
            }
            result.push_str(&content[last_end..detection.offset]);
            result.push_str(redaction_token(detection.kind));
            replacements += 1;
            last_end = detection.offset + detection.length;
        }
        result.push_str(&content[last_end..]);

        MaskOutcome {
            text: result,
            replacements,
        }
    }

    /// Full masking pass: regex, then the LLM fallback when the policy asks
    /// for it and the regex confidence is below the threshold.
    pub async fn mask(&self, content: &str, policy: &MaskingPolicy) -> MaskOutcome {
        let mut outcome = self.mask_text(content, policy);

        if !policy.llm_fallback {
            return outcome;
        }
        let Some(client) = &self.fallback else {
            return outcome;
        };
        if self.pass_confidence(policy) >= threshold_bar(policy.llm_fallback_threshold) {
            return outcome;
        }

        match self.fallback_spans(client.as_ref(), &outcome.text).await {
            Ok(spans) => {
                for span in spans {
                    if span.is_empty() {
                        continue;
                    }
                    let count = outcome.text.matches(&span).count() as u32;
                    if count > 0 {
                        outcome.text = outcome.text.replace(&span, FALLBACK_TOKEN);
                        outcome.replacements += count;
                    }
                }
            }
            Err(e) => {
                // Fallback failures degrade to the regex-only output.
                warn!(error = %e, "masker LLM fallback failed, keeping regex output");
            }
        }

        outcome
    }

    /// Mask every text content entry of a tool result in place.
    pub async fn mask_result(&self, result: &mut ToolCallResult, policy: &MaskingPolicy) -> u32 {
        let mut total = 0u32;
        for item in &mut result.content {
            if let ContentItem::Text(text) = item {
                if text.kind == "text" {
                    let outcome = self.mask(&text.text, policy).await;
                    text.text = outcome.text;
                    total += outcome.replacements;
                }
            }
        }
        total
    }

    /// Minimum regex confidence across the policy's enabled types.
    fn pass_confidence(&self, policy: &MaskingPolicy) -> f64 {
        self.patterns
            .iter()
            .filter(|p| policy.pii_types.contains(&p.kind))
            .map(|p| p.confidence)
            .fold(1.0, f64::min)
    }

    /// Ask the fallback LLM for exact PII substrings the regex pass missed.
    async fn fallback_spans(
        &self,
        client: &dyn ChatCompletionClient,
        content: &str,
    ) -> Result<Vec<String>, clip_types::ClipError> {
        let request = ChatRequest {
            system: "You extract personally identifiable information from text. \
                     Respond with a JSON array of the exact substrings that are PII. \
                     Respond with [] if there is none. No other output."
                .to_string(),
            user: content.to_string(),
            max_tokens: 512,
        };
        let response = client.complete(request).await?;
        let spans: Vec<String> = serde_json::from_str(response.content.trim()).map_err(|e| {
            clip_types::ClipError::Masker(format!("fallback returned non-JSON output: {e}"))
        })?;
        Ok(spans)
    }
}

impl Default for PiiMasker {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric bar for each fallback threshold level.
fn threshold_bar(threshold: FallbackThreshold) -> f64 {
    match threshold {
        FallbackThreshold::Low => 0.60,
        FallbackThreshold::Medium => 0.80,
        FallbackThreshold::High => 0.95,
    }
}

/// Compile a regex pattern, panicking on invalid patterns.
///
/// Only called during construction; a panic here is a bug in the pattern
/// table, not a runtime failure.
fn compile_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid masker regex '{pattern}': {e}"))
}

/// Validate a card number with the Luhn algorithm.
///
/// Strips spaces and dashes before validation; requires 13-19 digits and
/// rejects trivially uniform sequences.
fn luhn_check(input: &str) -> bool {
    let digits: Vec<u32> = input
        .chars()
        .filter(|c| c.is_ascii_digit())
        .filter_map(|c| c.to_digit(10))
        .collect();

    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    if digits.iter().all(|&d| d == digits[0]) {
        return false;
    }

    let mut sum: u32 = 0;
    for (i, &digit) in digits.iter().rev().enumerate() {
        if i % 2 == 1 {
            let doubled = digit * 2;
            sum += if doubled > 9 { doubled - 9 } else { doubled };
        } else {
            sum += digit;
        }
    }
    sum % 10 == 0
}

/// Validate an SSN against SSA assignment rules.
///
/// Area cannot be 000, 666, or 900-999; group cannot be 00; serial cannot
/// be 0000.
fn ssn_validate(input: &str) -> bool {
    let parts: Vec<&str> = input.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (Ok(area), Ok(group), Ok(serial)) = (
        parts[0].parse::<u32>(),
        parts[1].parse::<u32>(),
        parts[2].parse::<u32>(),
    ) else {
        return false;
    };
    area != 0 && area != 666 && area < 900 && group != 0 && serial != 0
}

/// All four IPv4 octets must fit in a byte.
fn ipv4_octets_valid(input: &str) -> bool {
    input
        .split('.')
        .all(|octet| octet.parse::<u32>().is_ok_and(|v| v <= 255))
}
