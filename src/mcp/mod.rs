//! MCP client: transport, discovery, and server lifecycle.

pub mod discovery;
pub mod launch;
pub mod manager;
pub mod relay;
pub mod transport;
pub mod types;

pub use manager::{McpServerManager, DEFAULT_MAX_SERVERS};
pub use transport::{
    Connection, ServerConnector, StdioConnector, StdioTransport, Transport, TransportError,
};
pub use types::{
    Notification, PromptDescriptor, ResourceDescriptor, ServerCapabilities, ServerSnapshot,
    ServerState, ToolCallResult, ToolContent, ToolDescriptor,
};
