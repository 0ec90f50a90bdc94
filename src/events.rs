//! Typed event bus for lifecycle and permission events.
//!
//! Consumers subscribe through a broadcast channel; every event carries a
//! fixed payload shape instead of a stringly event name. Emission is
//! fire-and-forget: events published with no live subscribers are dropped.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::mcp::types::{ResourceDescriptor, ServerState};
use crate::permission::approval::PendingApproval;

/// Events published by the orchestrator, at most once per occurrence.
#[derive(Debug, Clone)]
pub enum Event {
    /// A server moved to a new lifecycle state.
    ServerStateChanged { server_id: String, state: ServerState },
    /// Progress notification relayed verbatim from a server.
    Progress { server_id: String, payload: Value },
    /// Log message relayed verbatim from a server.
    LogMessage { server_id: String, payload: Value },
    /// A server's resource catalog changed; carries the fresh snapshot.
    ResourcesChanged {
        server_id: String,
        resources: Vec<ResourceDescriptor>,
    },
    /// A subscribed resource was updated.
    ResourceUpdated { server_id: String, uri: String },
    /// A tool call needs a human decision. Exactly one per new approval.
    PermissionRequested(PendingApproval),
    /// A persistent grant expires within a day.
    GrantExpiring {
        server_id: String,
        tool_name: String,
        expires_at: DateTime<Utc>,
    },
}

/// Cloneable handle to the broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // A send error only means nobody is listening right now.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
