/// Proxy core for CLIP.
///
/// Everything between the client-facing MCP loop and the upstream MCP
/// servers:
/// - **Transports**: stdio child processes and streamable HTTP upstreams
/// - **Registry**: live sessions, namespaced catalogs, call routing
/// - **Pipeline**: the per-call shaping orchestration
/// - **Server**: the MCP front-end loop
pub mod pipeline;
pub mod server;
pub mod transport_sse;
pub mod transport_stdio;
pub mod upstream;

pub use pipeline::CallPipeline;
pub use server::ProxyServer;
pub use transport_sse::SseTransport;
pub use transport_stdio::StdioTransport;
pub use upstream::UpstreamRegistry;
