//! Retry-escalation tracking.
//!
//! A client calling the same tool with the same arguments again inside the
//! configured window is signaling that the previous (possibly compressed)
//! response was not enough. Each repeat within the window multiplies the
//! summary budget: `multiplier^k` on the k-th repeat, with the exponent
//! capped. The factor applies to `max_output_tokens` only, never to the
//! compression threshold.
//!
//! Records are keyed by the same `(tool, args)` hash as the cache and live
//! until the window elapses past the first hit.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use clip_types::config::RetryEscalation;

struct RepeatRecord {
    count: u32,
    first_seen: Instant,
    last_seen: Instant,
}

/// Tracks repeated identical calls and produces the budget factor.
///
/// Constructed with `None` when escalation is disabled or absent; the
/// factor is then always 1.0.
pub struct EscalationTracker {
    policy: Option<RetryEscalation>,
    entries: Mutex<HashMap<String, RepeatRecord>>,
}

impl EscalationTracker {
    pub fn new(policy: Option<RetryEscalation>) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a call and return the budget factor to apply to it.
    pub async fn register(&self, key: &str) -> f64 {
        self.register_at(key, Instant::now()).await
    }

    /// Record a call at an explicit instant. Split out so the window
    /// arithmetic is testable without sleeping.
    pub async fn register_at(&self, key: &str, now: Instant) -> f64 {
        let Some(policy) = &self.policy else {
            return 1.0;
        };
        let window = Duration::from_secs(policy.window_seconds);

        let mut entries = self.entries.lock().await;
        let record = entries.entry(key.to_string()).or_insert(RepeatRecord {
            count: 0,
            first_seen: now,
            last_seen: now,
        });

        if record.count > 0 && now.duration_since(record.first_seen) > window {
            // Window elapsed: this call starts a fresh sequence.
            record.count = 0;
            record.first_seen = now;
        }
        record.count += 1;
        record.last_seen = now;

        let exponent = (record.count - 1).min(policy.max_levels);
        policy.token_multiplier.powi(exponent as i32)
    }

    /// Drop records whose window elapsed past the last hit.
    pub async fn prune(&self) {
        self.prune_at(Instant::now()).await;
    }

    async fn prune_at(&self, now: Instant) {
        let Some(policy) = &self.policy else {
            return;
        };
        let window = Duration::from_secs(policy.window_seconds);
        let mut entries = self.entries.lock().await;
        entries.retain(|_, record| now.duration_since(record.last_seen) <= window);
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
