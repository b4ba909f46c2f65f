//! Stdio transport to an upstream MCP server.
//!
//! Spawns the configured command as a child process and speaks
//! newline-delimited JSON-RPC over its stdin/stdout. The stream is
//! multiplexed: every outgoing request gets a unique id and an entry in a
//! pending map; one reader task pairs responses to requests by id. Timeouts
//! remove stale awaiters. Child stderr is captured and logged line by line.
//!
//! Malformed frames from the child are logged and dropped; the session
//! survives. Child death fails all pending requests and marks the
//! transport disconnected — there is no automatic restart.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use clip_types::traits::UpstreamTransport;
use clip_types::{ClipError, JsonRpcMessage};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, ClipError>>>>>;

/// Child-process JSON-RPC transport.
#[derive(Debug)]
pub struct StdioTransport {
    upstream_id: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Pending,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the upstream command and start the reader tasks.
    pub fn spawn(
        upstream_id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, ClipError> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ClipError::Upstream(format!("failed to spawn '{command}' for upstream '{upstream_id}': {e}"))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClipError::Upstream("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClipError::Upstream("child stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ClipError::Upstream("child stderr unavailable".to_string()))?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        // Reader task: pair responses to requests by id.
        {
            let pending = Arc::clone(&pending);
            let connected = Arc::clone(&connected);
            let upstream = upstream_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            let msg: JsonRpcMessage = match serde_json::from_str(line) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    warn!(
                                        upstream = %upstream,
                                        error = %e,
                                        "dropping malformed frame from upstream"
                                    );
                                    continue;
                                }
                            };
                            dispatch_response(&upstream, &pending, msg).await;
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // Wake everyone still waiting; the upstream is gone.
                let mut pending = pending.lock().await;
                for (_, tx) in pending.drain() {
                    let _ = tx.send(Err(ClipError::Upstream(format!(
                        "upstream '{upstream}' exited"
                    ))));
                }
                debug!(upstream = %upstream, "upstream stdout closed");
            });
        }

        // Stderr task: surface child diagnostics in our logs.
        {
            let upstream = upstream_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(upstream = %upstream, "upstream stderr: {line}");
                }
            });
        }

        Ok(Self {
            upstream_id: upstream_id.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending,
            next_id: AtomicU64::new(1),
            connected,
        })
    }

    async fn write_line(&self, msg: &JsonRpcMessage) -> Result<(), ClipError> {
        let mut text = serde_json::to_string(msg)?;
        text.push('\n');
        let mut stdin = self.stdin.lock().await;
        if let Err(e) = stdin.write_all(text.as_bytes()).await {
            self.connected.store(false, Ordering::SeqCst);
            return Err(ClipError::Upstream(format!(
                "write to upstream '{}' failed: {e}",
                self.upstream_id
            )));
        }
        stdin
            .flush()
            .await
            .map_err(|e| ClipError::Upstream(format!("flush to upstream '{}' failed: {e}", self.upstream_id)))
    }
}

/// Route one message from the child: responses complete their awaiter,
/// server-initiated traffic is logged and ignored.
async fn dispatch_response(upstream: &str, pending: &Pending, msg: JsonRpcMessage) {
    if msg.method.is_some() {
        debug!(
            upstream = %upstream,
            method = msg.method.as_deref().unwrap_or(""),
            "ignoring server-initiated message from upstream"
        );
        return;
    }
    let Some(id) = msg.id.as_ref().and_then(Value::as_u64) else {
        warn!(upstream = %upstream, "response without a numeric id, dropping");
        return;
    };
    let Some(tx) = pending.lock().await.remove(&id) else {
        // Stale response for a timed-out request.
        debug!(upstream = %upstream, id, "response for unknown request id");
        return;
    };
    let outcome = match msg.error {
        Some(err) => Err(ClipError::Upstream(format!(
            "upstream '{upstream}' returned error {}: {}",
            err.code, err.message
        ))),
        None => Ok(msg.result.unwrap_or(Value::Null)),
    };
    let _ = tx.send(outcome);
}

#[async_trait]
impl UpstreamTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClipError> {
        if !self.is_connected() {
            return Err(ClipError::Upstream(format!(
                "upstream '{}' unavailable",
                self.upstream_id
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = JsonRpcMessage::request(id, method, params);
        if let Err(e) = self.write_line(&msg).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClipError::Upstream(format!(
                "upstream '{}' session closed",
                self.upstream_id
            ))),
            Err(_) => {
                // Remove the stale awaiter so a late response is ignored.
                self.pending.lock().await.remove(&id);
                Err(ClipError::Timeout(format!(
                    "request '{method}' to upstream '{}' timed out after {}s",
                    self.upstream_id,
                    timeout.as_secs()
                )))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClipError> {
        self.write_line(&JsonRpcMessage::notification(method, params)).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        let _ = child.kill().await;
    }
}
