/// Unified error type for the CLIP proxy.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
/// Only configuration errors are fatal; everything else is scoped to a
/// single call and must never take down the proxy.
#[derive(Debug, thiserror::Error)]
pub enum ClipError {
    /// Invalid or unreadable configuration (fatal at startup).
    #[error("config error: {0}")]
    Config(String),

    /// An upstream MCP server failed: not running, transport broken, or
    /// the upstream itself returned an error.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// The requested tool, resource, or prompt is not served by any single
    /// upstream, as far as the advertised catalog is concerned.
    #[error("not found: {0}")]
    ToolNotFound(String),

    /// The summarizer LLM failed (timeout, bad HTTP status, malformed output).
    #[error("summarizer error: {0}")]
    Summarizer(String),

    /// The PII masker's LLM fallback pass failed.
    #[error("masker error: {0}")]
    Masker(String),

    /// Cache bookkeeping failed. Treated as a miss by callers.
    #[error("cache error: {0}")]
    Cache(String),

    /// A failure propagated to every waiter of a deduplicated computation.
    #[error("{0}")]
    Shared(std::sync::Arc<ClipError>),

    /// Error from an LLM endpoint (HTTP failure, bad payload).
    #[error("LLM error: {0}")]
    Llm(String),

    /// Malformed MCP frame from the client or an upstream.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An external call exceeded its configured timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ClipError {
    /// Peel off `Shared` wrappers so callers can match on the root cause.
    pub fn root(&self) -> &ClipError {
        match self {
            ClipError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ClipError {
    fn from(err: serde_json::Error) -> Self {
        ClipError::Serialization(err.to_string())
    }
}

impl From<std::sync::Arc<ClipError>> for ClipError {
    fn from(err: std::sync::Arc<ClipError>) -> Self {
        ClipError::Shared(err)
    }
}
