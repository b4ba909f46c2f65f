/// Shared types for the CLIP proxy.
///
/// These types are the lingua franca of the workspace — every crate imports
/// from here: the error type, the configuration tree, the MCP wire types,
/// and the trait contracts for the external seams (upstream transports and
/// LLM endpoints).
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod mcp;
pub mod traits;

pub use config::*;
pub use errors::ClipError;
pub use mcp::{
    ContentItem, JsonRpcError, JsonRpcMessage, McpToolDef, ShapingMeta, TextContent,
    ToolCallResult,
};
pub use traits::{ChatCompletionClient, ChatRequest, ChatResponse, UpstreamTransport};
