//! MCP server lifecycle management.
//!
//! Owns the registry of configured servers, drives each through its state
//! machine, and exposes the tool, resource, and prompt execution entry
//! points. Every tool call is routed through the permission engine before
//! it touches a transport. Only this module mutates registry entries or
//! holds transport handles.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::discovery::{self, Catalogs};
use super::relay;
use super::transport::{
    Connection, ServerConnector, StdioConnector, Transport, TransportError, PROTOCOL_VERSION,
};
use super::types::{
    PromptDescriptor, ResourceDescriptor, ServerCapabilities, ServerSnapshot, ServerState,
    ToolCallResult, ToolDescriptor,
};
use crate::config::{McpConfig, ServerConfig};
use crate::error::McpError;
use crate::events::{Event, EventBus};
use crate::permission::PermissionEngine;

/// Ceiling on concurrently registered servers.
pub const DEFAULT_MAX_SERVERS: usize = 8;

/// One registry entry. Created on start, mutated only by the manager,
/// removed on stop.
pub(crate) struct ServerRuntime {
    pub config: ServerConfig,
    pub state: ServerState,
    pub error: Option<String>,
    pub last_ready: Option<chrono::DateTime<Utc>>,
    pub transport: Option<Arc<dyn Transport>>,
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
    pub subscriptions: HashSet<String>,
    pub relay: Option<JoinHandle<()>>,
}

impl ServerRuntime {
    fn starting(config: ServerConfig) -> Self {
        Self {
            config,
            state: ServerState::Starting,
            error: None,
            last_ready: None,
            transport: None,
            tools: Vec::new(),
            resources: Vec::new(),
            prompts: Vec::new(),
            subscriptions: HashSet::new(),
            relay: None,
        }
    }

    pub(crate) fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            server_id: self.config.id.clone(),
            state: self.state,
            error: self.error.clone(),
            last_ready: self.last_ready,
            tools: self.tools.clone(),
            resources: self.resources.clone(),
            prompts: self.prompts.clone(),
        }
    }
}

pub(crate) type Registry = Arc<RwLock<HashMap<String, ServerRuntime>>>;

/// Supervises MCP server processes and mediates every capability call.
pub struct McpServerManager {
    servers: Registry,
    connector: Box<dyn ServerConnector>,
    permissions: Arc<PermissionEngine>,
    events: EventBus,
    max_servers: usize,
}

impl McpServerManager {
    /// Manager spawning real child processes over stdio.
    pub fn new(permissions: Arc<PermissionEngine>, events: EventBus) -> Self {
        Self::with_connector(Box::new(StdioConnector), permissions, events)
    }

    /// Manager with a custom connection factory, used by tests and by
    /// embedders bringing their own transport.
    pub fn with_connector(
        connector: Box<dyn ServerConnector>,
        permissions: Arc<PermissionEngine>,
        events: EventBus,
    ) -> Self {
        Self {
            servers: Arc::new(RwLock::new(HashMap::new())),
            connector,
            permissions,
            events,
            max_servers: DEFAULT_MAX_SERVERS,
        }
    }

    /// Override the registered-server ceiling.
    pub fn with_max_servers(mut self, max_servers: usize) -> Self {
        self.max_servers = max_servers;
        self
    }

    pub fn permissions(&self) -> Arc<PermissionEngine> {
        self.permissions.clone()
    }

    /// Spawn, connect, and discover a server, then mark it ready.
    ///
    /// Any step failure leaves the server registered in `Failed` state with
    /// the captured error and also returns that error to the caller.
    pub async fn start_server(&self, config: ServerConfig) -> Result<ServerSnapshot, McpError> {
        let server_id = config.id.clone();

        {
            let mut servers = self.servers.write().await;
            if let Some(existing) = servers.get(&server_id) {
                // Failed entries may be retried in place; live ones may not.
                if existing.state != ServerState::Failed {
                    return Err(McpError::AlreadyRunning(server_id));
                }
            } else if servers.len() >= self.max_servers {
                return Err(McpError::CapacityExceeded(servers.len()));
            }
            servers.insert(server_id.clone(), ServerRuntime::starting(config.clone()));
        }

        self.emit_state(&server_id, ServerState::Starting);
        tracing::info!(server = %server_id, command = %config.command, "starting MCP server");

        match self.connect_and_discover(&config).await {
            Ok((connection, catalogs)) => {
                let Connection {
                    transport,
                    notifications,
                } = connection;

                let relay = relay::spawn(
                    server_id.clone(),
                    transport.clone(),
                    notifications,
                    self.servers.clone(),
                    self.events.clone(),
                );

                let snapshot = {
                    let mut servers = self.servers.write().await;
                    let Some(runtime) = servers.get_mut(&server_id) else {
                        // Stopped while we were connecting.
                        relay.abort();
                        let _ = transport.close().await;
                        return Err(McpError::ServerNotRunning(server_id));
                    };
                    runtime.state = ServerState::Ready;
                    runtime.error = None;
                    runtime.last_ready = Some(Utc::now());
                    runtime.transport = Some(transport);
                    runtime.tools = catalogs.tools;
                    runtime.resources = catalogs.resources;
                    runtime.prompts = catalogs.prompts;
                    runtime.relay = Some(relay);
                    runtime.snapshot()
                };

                self.emit_state(&server_id, ServerState::Ready);
                tracing::info!(
                    server = %server_id,
                    tools = snapshot.tools.len(),
                    "MCP server ready"
                );
                Ok(snapshot)
            }
            Err(err) => {
                let message = err.to_string();
                {
                    let mut servers = self.servers.write().await;
                    if let Some(runtime) = servers.get_mut(&server_id) {
                        runtime.state = ServerState::Failed;
                        runtime.error = Some(message.clone());
                    }
                }
                self.emit_state(&server_id, ServerState::Failed);
                tracing::warn!(server = %server_id, error = %message, "MCP server failed to start");
                Err(err)
            }
        }
    }

    async fn connect_and_discover(
        &self,
        config: &ServerConfig,
    ) -> Result<(Connection, Catalogs), McpError> {
        let connection = self.connector.connect(config).await.map_err(|e| match e {
            TransportError::Spawn(message) => McpError::SpawnFailed(message),
            other => McpError::Protocol(other.to_string()),
        })?;
        let transport = connection.transport.clone();

        let init = transport
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        let capabilities: ServerCapabilities = init
            .get("capabilities")
            .cloned()
            .and_then(|c| serde_json::from_value(c).ok())
            .unwrap_or_default();

        let _ = transport.notify("notifications/initialized", None).await;

        let catalogs = discovery::discover(&config.id, &capabilities, &*transport)
            .await
            .map_err(|e| McpError::DiscoveryFailed(e.to_string()))?;

        Ok((connection, catalogs))
    }

    /// Stop a server and remove its registry entry. Idempotent: unknown ids
    /// are a no-op and emit nothing. Transport close failures are logged
    /// and swallowed; the entry is removed regardless.
    pub async fn stop_server(&self, server_id: &str) {
        let runtime = { self.servers.write().await.remove(server_id) };
        let Some(mut runtime) = runtime else {
            return;
        };

        if let Some(relay) = runtime.relay.take() {
            relay.abort();
        }
        if let Some(transport) = runtime.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::warn!(server = %server_id, error = %e, "failed to close server transport");
            }
        }

        self.emit_state(server_id, ServerState::Stopped);
        tracing::info!(server = %server_id, "MCP server stopped");
    }

    /// Execute a tool, gated by the permission engine. A successful call
    /// refreshes the server's liveness timestamp.
    pub async fn execute_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<ToolCallResult, McpError> {
        let (server_name, descriptor, transport) = {
            let servers = self.servers.read().await;
            let runtime = self.ready_runtime(&servers, server_id)?;
            let descriptor = runtime
                .tools
                .iter()
                .find(|t| t.name == tool_name)
                .cloned()
                .ok_or_else(|| McpError::ToolNotFound {
                    server: server_id.to_string(),
                    tool: tool_name.to_string(),
                })?;
            (
                runtime.config.name.clone(),
                descriptor,
                self.transport_of(runtime, server_id)?,
            )
        };

        self.permissions
            .authorize(server_id, &server_name, &descriptor, &args)
            .await?;

        let result = transport
            .request(
                "tools/call",
                Some(json!({"name": tool_name, "arguments": args})),
            )
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;
        let result: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tool result: {}", e)))?;

        {
            let mut servers = self.servers.write().await;
            if let Some(runtime) = servers.get_mut(server_id) {
                runtime.last_ready = Some(Utc::now());
            }
        }

        Ok(result)
    }

    /// Read a resource from a ready server.
    pub async fn read_resource(&self, server_id: &str, uri: &str) -> Result<Value, McpError> {
        let transport = {
            let servers = self.servers.read().await;
            let runtime = self.ready_runtime(&servers, server_id)?;
            if !runtime.resources.iter().any(|r| r.uri == uri) {
                return Err(McpError::ResourceNotFound {
                    server: server_id.to_string(),
                    uri: uri.to_string(),
                });
            }
            self.transport_of(runtime, server_id)?
        };

        transport
            .request("resources/read", Some(json!({"uri": uri})))
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))
    }

    /// Subscribe to resource-update notifications. Subscribing twice is a
    /// silent success.
    pub async fn subscribe_to_resource(&self, server_id: &str, uri: &str) -> Result<(), McpError> {
        let transport = {
            let servers = self.servers.read().await;
            let runtime = self.ready_runtime(&servers, server_id)?;
            if runtime.subscriptions.contains(uri) {
                return Ok(());
            }
            self.transport_of(runtime, server_id)?
        };

        transport
            .request("resources/subscribe", Some(json!({"uri": uri})))
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut servers = self.servers.write().await;
        if let Some(runtime) = servers.get_mut(server_id) {
            runtime.subscriptions.insert(uri.to_string());
        }
        Ok(())
    }

    /// Drop a resource subscription. Unsubscribing when not subscribed is a
    /// silent success.
    pub async fn unsubscribe_from_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<(), McpError> {
        let transport = {
            let servers = self.servers.read().await;
            let runtime = self.ready_runtime(&servers, server_id)?;
            if !runtime.subscriptions.contains(uri) {
                return Ok(());
            }
            self.transport_of(runtime, server_id)?
        };

        transport
            .request("resources/unsubscribe", Some(json!({"uri": uri})))
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))?;

        let mut servers = self.servers.write().await;
        if let Some(runtime) = servers.get_mut(server_id) {
            runtime.subscriptions.remove(uri);
        }
        Ok(())
    }

    /// Fetch a prompt. Prompts are read operations and bypass the
    /// permission gate.
    pub async fn execute_prompt(
        &self,
        server_id: &str,
        prompt_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        let transport = {
            let servers = self.servers.read().await;
            let runtime = self.ready_runtime(&servers, server_id)?;
            if !runtime.prompts.iter().any(|p| p.name == prompt_name) {
                return Err(McpError::PromptNotFound {
                    server: server_id.to_string(),
                    prompt: prompt_name.to_string(),
                });
            }
            self.transport_of(runtime, server_id)?
        };

        let mut params = json!({"name": prompt_name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }

        transport
            .request("prompts/get", Some(params))
            .await
            .map_err(|e| McpError::Protocol(e.to_string()))
    }

    /// Tools across all servers currently in `Ready` state.
    pub async fn get_all_available_tools(&self) -> Vec<ToolDescriptor> {
        let servers = self.servers.read().await;
        servers
            .values()
            .filter(|r| r.state.is_ready())
            .flat_map(|r| r.tools.iter().cloned())
            .collect()
    }

    /// Resources across all ready servers.
    pub async fn get_all_available_resources(&self) -> Vec<ResourceDescriptor> {
        let servers = self.servers.read().await;
        servers
            .values()
            .filter(|r| r.state.is_ready())
            .flat_map(|r| r.resources.iter().cloned())
            .collect()
    }

    /// Prompts across all ready servers.
    pub async fn get_all_available_prompts(&self) -> Vec<PromptDescriptor> {
        let servers = self.servers.read().await;
        servers
            .values()
            .filter(|r| r.state.is_ready())
            .flat_map(|r| r.prompts.iter().cloned())
            .collect()
    }

    pub async fn get_server_state(&self, server_id: &str) -> Option<ServerSnapshot> {
        self.servers
            .read()
            .await
            .get(server_id)
            .map(ServerRuntime::snapshot)
    }

    pub async fn list_servers(&self) -> Vec<ServerSnapshot> {
        self.servers
            .read()
            .await
            .values()
            .map(ServerRuntime::snapshot)
            .collect()
    }

    /// Start every configured server marked enabled and auto-start,
    /// collecting the per-server outcome.
    pub async fn start_enabled_servers(
        &self,
        config: &McpConfig,
    ) -> Vec<(String, Result<ServerSnapshot, McpError>)> {
        let mut ids: Vec<&String> = config
            .servers
            .iter()
            .filter(|(_, server)| server.enabled && server.auto_start)
            .map(|(id, _)| id)
            .collect();
        ids.sort();

        let mut results = Vec::new();
        for id in ids {
            let server = config.servers[id].clone();
            let result = self.start_server(server).await;
            results.push((id.clone(), result));
        }
        results
    }

    /// Deny pending approvals, close every connection, and empty the
    /// registry. Safe to call with flows in flight.
    pub async fn shutdown(&self) {
        self.permissions.shutdown();

        let ids: Vec<String> = { self.servers.read().await.keys().cloned().collect() };
        for id in ids {
            self.stop_server(&id).await;
        }
        tracing::info!("MCP server manager shut down");
    }

    fn ready_runtime<'a>(
        &self,
        servers: &'a HashMap<String, ServerRuntime>,
        server_id: &str,
    ) -> Result<&'a ServerRuntime, McpError> {
        let runtime = servers
            .get(server_id)
            .ok_or_else(|| McpError::ServerNotRunning(server_id.to_string()))?;
        if !runtime.state.is_ready() {
            return Err(McpError::ServerNotReady {
                server: server_id.to_string(),
                state: runtime.state,
            });
        }
        Ok(runtime)
    }

    fn transport_of(
        &self,
        runtime: &ServerRuntime,
        server_id: &str,
    ) -> Result<Arc<dyn Transport>, McpError> {
        runtime
            .transport
            .clone()
            .ok_or_else(|| McpError::ServerNotReady {
                server: server_id.to_string(),
                state: runtime.state,
            })
    }

    fn emit_state(&self, server_id: &str, state: ServerState) {
        self.events.emit(Event::ServerStateChanged {
            server_id: server_id.to_string(),
            state,
        });
    }
}
