//! Server configuration records and the configuration-store seam.
//!
//! The orchestrator never reads or writes configuration files itself; a
//! collaborator implementing [`ConfigStore`] owns persistence. `McpConfig`
//! is TOML-friendly so stores can keep a `servers.toml` and merge a
//! project-level file over a global one.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// How to reach a configured server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    /// Spawn a child process and speak JSON-RPC over its stdio.
    #[default]
    Stdio,
    /// Connect to an already-running server over HTTP.
    Http { url: String },
}

/// Definition of a single MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique identifier used as the registry key.
    pub id: String,
    /// Display name shown in approval prompts and event payloads.
    pub name: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to launch the server process.
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables; values may reference `${VAR}`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the spawned process.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Whether the server may be started at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether `start_enabled_servers` should bring this server up.
    #[serde(default)]
    pub auto_start: bool,
}

impl ServerConfig {
    /// Minimal stdio config, mostly useful in tests.
    pub fn stdio(id: impl Into<String>, name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            transport: TransportKind::Stdio,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            enabled: true,
            auto_start: false,
        }
    }
}

/// Collection of server definitions keyed by server id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl McpConfig {
    /// Parse from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse MCP server configuration")
    }

    /// Merge another config (other takes precedence).
    pub fn merge(&mut self, other: McpConfig) {
        for (id, server) in other.servers {
            self.servers.insert(id, server);
        }
    }
}

/// Persistence seam for server configurations. The orchestrator consumes
/// records from a store; it never touches configuration files directly.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load(&self) -> Result<McpConfig>;
    async fn add_server(&self, config: ServerConfig) -> Result<()>;
    async fn update_server(&self, config: ServerConfig) -> Result<()>;
    async fn remove_server(&self, server_id: &str) -> Result<()>;
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let config = McpConfig::from_toml(
            r#"
            [servers.fs]
            id = "fs"
            name = "Filesystem"
            command = "npx"
            args = ["-y", "@modelcontextprotocol/server-filesystem"]
            "#,
        )
        .unwrap();

        let server = &config.servers["fs"];
        assert_eq!(server.command, "npx");
        assert_eq!(server.transport, TransportKind::Stdio);
        assert!(server.enabled);
        assert!(!server.auto_start);
    }

    #[test]
    fn test_http_transport_kind() {
        let config = McpConfig::from_toml(
            r#"
            [servers.remote]
            id = "remote"
            name = "Remote"
            command = ""

            [servers.remote.transport.http]
            url = "http://localhost:8080/mcp"
            "#,
        )
        .unwrap();

        match &config.servers["remote"].transport {
            TransportKind::Http { url } => assert_eq!(url, "http://localhost:8080/mcp"),
            other => panic!("expected http transport, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_overrides() {
        let mut global = McpConfig::default();
        global
            .servers
            .insert("fs".into(), ServerConfig::stdio("fs", "Global FS", "global-cmd"));

        let mut project = McpConfig::default();
        project
            .servers
            .insert("fs".into(), ServerConfig::stdio("fs", "Project FS", "project-cmd"));
        project
            .servers
            .insert("git".into(), ServerConfig::stdio("git", "Git", "git-mcp"));

        global.merge(project);
        assert_eq!(global.servers.len(), 2);
        assert_eq!(global.servers["fs"].command, "project-cmd");
    }
}
