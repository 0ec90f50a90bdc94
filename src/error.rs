//! Error types surfaced by the lifecycle manager and permission engine.

use crate::mcp::types::ServerState;

/// Errors returned by orchestrator operations.
///
/// Startup failures (`SpawnFailed`, `Protocol`, `DiscoveryFailed`) are also
/// recorded in the server's `Failed` state so other components can observe
/// them later; execution-time errors propagate to the caller only.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("server limit reached ({0} servers registered)")]
    CapacityExceeded(usize),

    #[error("server already running: {0}")]
    AlreadyRunning(String),

    #[error("server not running: {0}")]
    ServerNotRunning(String),

    #[error("server '{server}' is not ready (state: {state})")]
    ServerNotReady { server: String, state: ServerState },

    #[error("tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    #[error("resource '{uri}' not found on server '{server}'")]
    ResourceNotFound { server: String, uri: String },

    #[error("prompt '{prompt}' not found on server '{server}'")]
    PromptNotFound { server: String, prompt: String },

    #[error("permission denied for tool '{tool}': {reason}")]
    PermissionDenied { tool: String, reason: String },

    #[error("failed to spawn server process: {0}")]
    SpawnFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("capability discovery failed: {0}")]
    DiscoveryFailed(String),
}
