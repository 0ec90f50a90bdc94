//! toolgate: MCP server orchestration with permission gating
//!
//! This library provides:
//! - Lifecycle supervision for MCP server processes: spawn, handshake,
//!   capability discovery, teardown
//! - A line-delimited JSON-RPC stdio transport with an async notification
//!   relay
//! - A permission engine that gates every tool call behind stored grants,
//!   keyword risk assessment, and time-bounded interactive approval
//!
//! Wire the pieces explicitly at process start: build an [`EventBus`], a
//! [`PermissionEngine`] backed by a grant store, and an
//! [`McpServerManager`], then hand the manager to whatever drives it.

pub mod config;
pub mod error;
pub mod events;
pub mod mcp;
pub mod permission;

pub use config::{ConfigStore, McpConfig, ServerConfig, TransportKind};
pub use error::McpError;
pub use events::{Event, EventBus};
pub use mcp::{McpServerManager, ServerSnapshot, ServerState};
pub use permission::{
    ApprovalResponse, GrantScope, PendingApproval, PermissionEngine, PermissionSettings, RiskLevel,
};
