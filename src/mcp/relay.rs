//! Relays asynchronous server notifications onto the event bus.
//!
//! One relay task per connected server. Progress, log, and resource-update
//! notifications are republished verbatim, tagged with the server id. A
//! resource list-changed signal triggers a re-list so subscribers always
//! see a full fresh snapshot instead of a delta.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::discovery;
use super::manager::Registry;
use super::transport::Transport;
use super::types::Notification;
use crate::events::{Event, EventBus};

pub(crate) fn spawn(
    server_id: String,
    transport: Arc<dyn Transport>,
    mut notifications: mpsc::UnboundedReceiver<Notification>,
    servers: Registry,
    events: EventBus,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            handle(&server_id, &notification, &*transport, &servers, &events).await;
        }
        tracing::debug!(server = %server_id, "notification stream ended");
    })
}

async fn handle(
    server_id: &str,
    notification: &Notification,
    transport: &dyn Transport,
    servers: &Registry,
    events: &EventBus,
) {
    let payload = notification.params.clone().unwrap_or(serde_json::Value::Null);

    match notification.method.as_str() {
        "notifications/progress" => {
            events.emit(Event::Progress {
                server_id: server_id.to_string(),
                payload,
            });
        }
        "notifications/message" => {
            events.emit(Event::LogMessage {
                server_id: server_id.to_string(),
                payload,
            });
        }
        "notifications/resources/updated" => {
            let uri = notification
                .params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string();
            events.emit(Event::ResourceUpdated {
                server_id: server_id.to_string(),
                uri,
            });
        }
        "notifications/resources/list_changed" => {
            match transport.request("resources/list", None).await {
                Ok(result) => {
                    let resources = discovery::parse_resources(server_id, &result);
                    {
                        let mut servers = servers.write().await;
                        if let Some(runtime) = servers.get_mut(server_id) {
                            runtime.resources = resources.clone();
                        }
                    }
                    events.emit(Event::ResourcesChanged {
                        server_id: server_id.to_string(),
                        resources,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        server = %server_id,
                        error = %e,
                        "failed to re-list resources after change notification"
                    );
                }
            }
        }
        other => {
            tracing::debug!(server = %server_id, method = %other, "unhandled notification");
        }
    }
}
