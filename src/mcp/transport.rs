//! Stdio transport for MCP server processes.
//!
//! Speaks line-delimited JSON-RPC 2.0 over a spawned child's stdin/stdout.
//! A background reader task routes responses to per-request channels and
//! forwards server-initiated notifications to the connection's stream, so
//! requests from different callers can be in flight concurrently.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::launch;
use super::types::Notification;
use crate::config::{ServerConfig, TransportKind};

/// JSON-RPC protocol revision spoken on the wire.
pub const JSONRPC_VERSION: &str = "2.0";
/// MCP protocol revision sent during the initialize handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Errors produced at the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to spawn server process: {0}")]
    Spawn(String),

    #[error("server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcNotification {
    jsonrpc: &'static str,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Duplex channel to one server. Implementations must support concurrent
/// requests from multiple tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the matching response.
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError>;

    /// Send a notification; no response is expected.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Tear the connection down. In-flight requests fail with `Closed`.
    async fn close(&self) -> Result<(), TransportError>;
}

/// A freshly established connection: the request channel plus the stream of
/// server-initiated notifications.
pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Connection factory, one per transport family. Tests substitute a scripted
/// implementation.
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection, TransportError>;
}

/// Classification of one line read from the server's stdout.
enum Incoming {
    Response {
        id: u64,
        result: Result<Value, TransportError>,
    },
    Notification(Notification),
    Other,
}

fn classify_line(line: &str) -> Option<Incoming> {
    let value: Value = serde_json::from_str(line).ok()?;
    let id = value.get("id").and_then(Value::as_u64);
    let method = value.get("method").and_then(Value::as_str);

    match (id, method) {
        (Some(id), None) => {
            if let Some(error) = value.get("error") {
                let error: JsonRpcError = serde_json::from_value(error.clone()).ok()?;
                Some(Incoming::Response {
                    id,
                    result: Err(TransportError::Rpc {
                        code: error.code,
                        message: error.message,
                    }),
                })
            } else {
                let result = value.get("result").cloned().unwrap_or(Value::Null);
                Some(Incoming::Response {
                    id,
                    result: Ok(result),
                })
            }
        }
        (None, Some(method)) => Some(Incoming::Notification(Notification {
            method: method.to_string(),
            params: value.get("params").cloned(),
        })),
        // Server-to-client requests (sampling etc.) are not supported here.
        _ => Some(Incoming::Other),
    }
}

type PendingMap = Arc<DashMap<u64, oneshot::Sender<Result<Value, TransportError>>>>;

/// JSON-RPC over a child process's stdio.
pub struct StdioTransport {
    child: Mutex<Child>,
    stdin: Mutex<tokio::process::ChildStdin>,
    next_id: AtomicU64,
    pending: PendingMap,
}

impl StdioTransport {
    /// Spawn the configured server process and start the reader task.
    pub async fn spawn(
        config: &ServerConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Notification>), TransportError> {
        let program = launch::resolve_command(&config.command);

        let mut cmd = Command::new(&program);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Pass stderr through for debugging
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, launch::expand_env_vars(value));
        }

        if let Some(dir) = &config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Spawn(format!("{}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".into()))?;

        let pending: PendingMap = Arc::new(DashMap::new());
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            BufReader::new(stdout),
            pending.clone(),
            notify_tx,
        ));

        tracing::debug!(
            command = %launch::display_command(&program, &config.args),
            "spawned MCP server process"
        );

        Ok((
            Self {
                child: Mutex::new(child),
                stdin: Mutex::new(stdin),
                next_id: AtomicU64::new(1),
                pending,
            },
            notify_rx,
        ))
    }
}

async fn read_loop(
    mut reader: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    notify_tx: mpsc::UnboundedSender<Notification>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::debug!(line = %trimmed, "MCP message received");
                match classify_line(trimmed) {
                    Some(Incoming::Response { id, result }) => {
                        if let Some((_, tx)) = pending.remove(&id) {
                            let _ = tx.send(result);
                        }
                    }
                    Some(Incoming::Notification(notification)) => {
                        let _ = notify_tx.send(notification);
                    }
                    Some(Incoming::Other) => {
                        tracing::debug!("ignoring unsupported message from server");
                    }
                    None => {
                        tracing::warn!(line = %trimmed, "discarding unparseable server output");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "error reading from MCP server");
                break;
            }
        }
    }

    // The process is gone; fail everything still waiting.
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.to_string(),
            params,
        };
        let payload =
            serde_json::to_string(&request).map_err(|e| TransportError::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        tracing::debug!(request = %payload, "MCP request");

        let write_result: Result<(), std::io::Error> = async {
            let mut stdin = self.stdin.lock().await;
            stdin.write_all(payload.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            self.pending.remove(&id);
            return Err(e.into());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notification = JsonRpcNotification {
            jsonrpc: JSONRPC_VERSION,
            method: method.to_string(),
            params,
        };
        let payload = serde_json::to_string(&notification)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        tracing::debug!(notification = %payload, "MCP notification");

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(payload.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut child = self.child.lock().await;
        child.kill().await?;
        Ok(())
    }
}

/// Default connector: spawns child processes for stdio servers.
pub struct StdioConnector;

#[async_trait]
impl ServerConnector for StdioConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection, TransportError> {
        match &config.transport {
            TransportKind::Stdio => {}
            TransportKind::Http { url } => {
                return Err(TransportError::Protocol(format!(
                    "HTTP transport not yet supported (url: {})",
                    url
                )));
            }
        }

        let (transport, notifications) = StdioTransport::spawn(config).await?;
        Ok(Connection {
            transport: Arc::new(transport),
            notifications,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(value: Value) -> Incoming {
        classify_line(&value.to_string()).unwrap()
    }

    #[test]
    fn test_classify_success_response() {
        match classify(json!({"jsonrpc": "2.0", "id": 3, "result": {"tools": []}})) {
            Incoming::Response { id, result } => {
                assert_eq!(id, 3);
                assert_eq!(result.unwrap(), json!({"tools": []}));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_classify_error_response() {
        match classify(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "error": {"code": -32601, "message": "Method not found"}
        })) {
            Incoming::Response { id, result } => {
                assert_eq!(id, 7);
                match result.unwrap_err() {
                    TransportError::Rpc { code, message } => {
                        assert_eq!(code, -32601);
                        assert_eq!(message, "Method not found");
                    }
                    other => panic!("unexpected error: {:?}", other),
                }
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn test_classify_notification() {
        match classify(json!({
            "jsonrpc": "2.0",
            "method": "notifications/progress",
            "params": {"progress": 5}
        })) {
            Incoming::Notification(n) => {
                assert_eq!(n.method, "notifications/progress");
                assert_eq!(n.params.unwrap()["progress"], 5);
            }
            _ => panic!("expected notification"),
        }
    }

    #[test]
    fn test_classify_server_request_is_other() {
        // A message with both id and method is a server-to-client request.
        match classify(json!({"jsonrpc": "2.0", "id": 1, "method": "sampling/createMessage"})) {
            Incoming::Other => {}
            _ => panic!("expected other"),
        }
    }

    #[test]
    fn test_classify_garbage_is_none() {
        assert!(classify_line("not json at all").is_none());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let config = ServerConfig::stdio("x", "X", "toolgate-definitely-not-a-command");
        let result = StdioTransport::spawn(&config).await;
        assert!(matches!(result, Err(TransportError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_http_connector_unsupported() {
        let mut config = ServerConfig::stdio("x", "X", "");
        config.transport = TransportKind::Http {
            url: "http://localhost:9999".into(),
        };
        let result = StdioConnector.connect(&config).await;
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }
}
