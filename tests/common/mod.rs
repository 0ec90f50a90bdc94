//! Shared test fixtures: a scripted transport and connector so lifecycle
//! tests run without spawning real server processes.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use toolgate::events::{Event, EventBus};
use toolgate::mcp::transport::{Connection, ServerConnector, Transport, TransportError};
use toolgate::mcp::types::Notification;
use toolgate::mcp::McpServerManager;
use toolgate::permission::{
    ApprovalResponse, MemoryGrantStore, PermissionEngine, PermissionSettings,
};
use toolgate::ServerConfig;

/// Catalogs served by every fake transport a connector creates. Shared so
/// tests can swap contents and trigger re-discovery.
#[derive(Default)]
pub struct SharedCatalogs {
    pub tools: Mutex<Vec<Value>>,
    pub resources: Mutex<Vec<Value>>,
    pub prompts: Mutex<Vec<Value>>,
}

/// In-memory transport answering the protocol methods the manager uses.
pub struct FakeTransport {
    catalogs: Arc<SharedCatalogs>,
    calls: Mutex<Vec<(String, Option<Value>)>>,
}

impl FakeTransport {
    pub fn calls_of(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        match method {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {
                    "tools": {"listChanged": true},
                    "resources": {"listChanged": true, "subscribe": true},
                    "prompts": {}
                },
                "serverInfo": {"name": "fake-server", "version": "0.0.1"}
            })),
            "tools/list" => {
                let tools = self.catalogs.tools.lock().unwrap().clone();
                Ok(json!({"tools": tools}))
            }
            "resources/list" => {
                let resources = self.catalogs.resources.lock().unwrap().clone();
                Ok(json!({"resources": resources}))
            }
            "prompts/list" => {
                let prompts = self.catalogs.prompts.lock().unwrap().clone();
                Ok(json!({"prompts": prompts}))
            }
            "tools/call" => Ok(json!({
                "content": [{"type": "text", "text": "ok"}],
                "isError": false
            })),
            "resources/read" => Ok(json!({
                "contents": [{"uri": params.and_then(|p| p.get("uri").cloned()), "text": "data"}]
            })),
            "resources/subscribe" | "resources/unsubscribe" => Ok(json!({})),
            "prompts/get" => Ok(json!({"description": "", "messages": []})),
            other => Err(TransportError::Protocol(format!(
                "unexpected method: {}",
                other
            ))),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct FakeConnectorInner {
    catalogs: Arc<SharedCatalogs>,
    fail_next_connect: AtomicBool,
    transports: Mutex<HashMap<String, Arc<FakeTransport>>>,
    notifiers: Mutex<HashMap<String, mpsc::UnboundedSender<Notification>>>,
}

/// Connection factory handing out fake transports, with handles back to
/// them so tests can inspect calls and push notifications.
#[derive(Clone)]
pub struct FakeConnector {
    inner: Arc<FakeConnectorInner>,
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        let catalogs = SharedCatalogs::default();
        *catalogs.tools.lock().unwrap() = vec![
            json!({
                "name": "read_file",
                "description": "Read a file from disk",
                "inputSchema": {"type": "object"}
            }),
            json!({
                "name": "echo",
                "description": "Repeats its input",
                "inputSchema": {"type": "object"}
            }),
        ];
        *catalogs.resources.lock().unwrap() = vec![json!({
            "uri": "file:///data/a.txt",
            "name": "a.txt",
            "mimeType": "text/plain"
        })];
        *catalogs.prompts.lock().unwrap() = vec![json!({
            "name": "summarize",
            "description": "Summarize a document"
        })];

        Self {
            inner: Arc::new(FakeConnectorInner {
                catalogs: Arc::new(catalogs),
                fail_next_connect: AtomicBool::new(false),
                transports: Mutex::new(HashMap::new()),
                notifiers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make the next connect attempt fail like a bad spawn.
    pub fn fail_next_connect(&self) {
        self.inner.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn transport(&self, server_id: &str) -> Arc<FakeTransport> {
        self.inner.transports.lock().unwrap()[server_id].clone()
    }

    /// Push a server-initiated notification into the relay.
    pub fn send_notification(&self, server_id: &str, method: &str, params: Value) {
        let notifiers = self.inner.notifiers.lock().unwrap();
        notifiers[server_id]
            .send(Notification {
                method: method.to_string(),
                params: Some(params),
            })
            .unwrap();
    }

    pub fn set_resources(&self, resources: Vec<Value>) {
        *self.inner.catalogs.resources.lock().unwrap() = resources;
    }
}

#[async_trait]
impl ServerConnector for FakeConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Connection, TransportError> {
        if self.inner.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(TransportError::Spawn("simulated spawn failure".into()));
        }

        let transport = Arc::new(FakeTransport {
            catalogs: self.inner.catalogs.clone(),
            calls: Mutex::new(Vec::new()),
        });
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        self.inner
            .transports
            .lock()
            .unwrap()
            .insert(config.id.clone(), transport.clone());
        self.inner
            .notifiers
            .lock()
            .unwrap()
            .insert(config.id.clone(), notify_tx);

        Ok(Connection {
            transport,
            notifications: notify_rx,
        })
    }
}

/// Opt-in log output for debugging test runs, driven by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Fully wired stack on fake transports.
pub async fn stack(
    settings: PermissionSettings,
) -> (
    Arc<McpServerManager>,
    FakeConnector,
    EventBus,
    Arc<PermissionEngine>,
) {
    init_tracing();
    let events = EventBus::default();
    let engine = Arc::new(
        PermissionEngine::new(settings, Box::new(MemoryGrantStore::default()), events.clone())
            .await
            .unwrap(),
    );
    let connector = FakeConnector::new();
    let manager = Arc::new(McpServerManager::with_connector(
        Box::new(connector.clone()),
        engine.clone(),
        events.clone(),
    ));
    (manager, connector, events, engine)
}

pub fn server_config(id: &str) -> ServerConfig {
    ServerConfig::stdio(id, format!("{} server", id), "fake-mcp")
}

/// Answer exactly one permission request from the bus, then exit.
pub fn respond_next(engine: Arc<PermissionEngine>, events: &EventBus, response: ApprovalResponse) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(Event::PermissionRequested(pending)) => {
                    engine.respond_to_approval(pending.id, response);
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    });
}

/// Drain everything currently buffered on a subscription, returning the
/// number of permission requests seen.
pub fn drain_permission_requests(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::PermissionRequested(_)) {
            count += 1;
        }
    }
    count
}
