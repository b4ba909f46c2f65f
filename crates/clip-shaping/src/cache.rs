//! Keyed cache of shaped responses with single-flight deduplication.
//!
//! The map holds either a finished value or a pending computation. The
//! pending placeholder is inserted atomically (under the map mutex) before
//! the builder runs, so at most one builder is ever in flight per key;
//! concurrent callers subscribe to the placeholder and receive the same
//! result. The builder runs in a spawned task — the caller that started it
//! can be cancelled without killing the computation for the other waiters.
//!
//! Eviction is lazy on read, with an optional `sweep` for a background task.
//! Failures remove the placeholder and propagate to every waiter; negative
//! results are never cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, Mutex};

use clip_types::ClipError;

/// Compute the cache key for a call: SHA-256 over the qualified tool name
/// and the canonical form of the (post-override) arguments.
pub fn cache_key(qualified: &str, args: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(qualified.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(args).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a JSON value with object keys sorted recursively.
///
/// `serde_json` map ordering depends on build features, so the ordering is
/// pinned here instead. Numbers render exactly as `serde_json` renders them.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub struct CacheLookup<V> {
    /// The stored or freshly computed value.
    pub value: V,
    /// True when the value was served from a previously stored entry.
    pub hit: bool,
}

enum Slot<V> {
    Ready {
        value: V,
        inserted_at: Instant,
        ttl: Duration,
    },
    Pending(broadcast::Sender<Result<V, Arc<ClipError>>>),
}

enum Plan<V> {
    Hit(V),
    Wait(broadcast::Receiver<Result<V, Arc<ClipError>>>),
    Run(broadcast::Receiver<Result<V, Arc<ClipError>>>),
}

/// In-memory response cache with single-flight builders.
pub struct ResponseCache<V> {
    slots: Arc<Mutex<HashMap<String, Slot<V>>>>,
}

impl<V> Clone for ResponseCache<V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<V> Default for ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ResponseCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Look up `key`; on a miss, run `build` and store its result for `ttl`.
    ///
    /// Exactly one builder runs per key at a time. Concurrent callers for
    /// the same key all receive the first builder's result, including its
    /// error — the error is not stored, so the next call recomputes.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        build: F,
    ) -> Result<CacheLookup<V>, ClipError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ClipError>> + Send + 'static,
    {
        let plan = {
            let mut slots = self.slots.lock().await;
            match slots.get(key) {
                Some(Slot::Ready {
                    value,
                    inserted_at,
                    ttl,
                }) if inserted_at.elapsed() < *ttl => Plan::Hit(value.clone()),
                Some(Slot::Pending(tx)) => Plan::Wait(tx.subscribe()),
                other => {
                    if other.is_some() {
                        // Expired entry: evict before it can be served.
                        slots.remove(key);
                    }
                    let (tx, rx) = broadcast::channel(4);
                    slots.insert(key.to_string(), Slot::Pending(tx.clone()));
                    drop(slots);

                    let future = build();
                    let slots = Arc::clone(&self.slots);
                    let key = key.to_string();
                    tokio::spawn(async move {
                        let result = future.await;
                        let mut slots = slots.lock().await;
                        match &result {
                            Ok(value) => {
                                slots.insert(
                                    key,
                                    Slot::Ready {
                                        value: value.clone(),
                                        inserted_at: Instant::now(),
                                        ttl,
                                    },
                                );
                            }
                            Err(_) => {
                                slots.remove(&key);
                            }
                        }
                        drop(slots);
                        let _ = tx.send(result.map_err(Arc::new));
                    });
                    Plan::Run(rx)
                }
            }
        };

        match plan {
            Plan::Hit(value) => Ok(CacheLookup { value, hit: true }),
            Plan::Wait(rx) | Plan::Run(rx) => Self::await_flight(rx).await,
        }
    }

    async fn await_flight(
        mut rx: broadcast::Receiver<Result<V, Arc<ClipError>>>,
    ) -> Result<CacheLookup<V>, ClipError> {
        match rx.recv().await {
            Ok(Ok(value)) => Ok(CacheLookup { value, hit: false }),
            Ok(Err(shared)) => Err(ClipError::Shared(shared)),
            Err(_) => Err(ClipError::Cache(
                "in-flight computation was abandoned".to_string(),
            )),
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready {
                inserted_at, ttl, ..
            } => inserted_at.elapsed() < *ttl,
            Slot::Pending(_) => true,
        });
        before - slots.len()
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}
