//! Permission decisions for tool execution.
//!
//! Every tool call passes through [`PermissionEngine::authorize`], which
//! works through four decision paths in order: stored persistent grant,
//! session grant, risk assessment with auto-approval, and finally a
//! time-bounded interactive approval. A timeout is an expected outcome of
//! the interactive path and resolves to denial, not an error.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use super::approval::{ApprovalResponse, PendingApproval, PendingEntry};
use super::grants::{
    argument_fingerprint, grant_key, security_context, session_key, GrantScope, GrantStore,
    PermissionRule, SessionGrants, ToolPermission,
};
use super::risk::{self, RiskAssessment, RiskLevel};
use super::settings::PermissionSettings;
use crate::error::McpError;
use crate::events::{Event, EventBus};
use crate::mcp::types::ToolDescriptor;

pub struct PermissionEngine {
    settings: RwLock<PermissionSettings>,
    grants: RwLock<HashMap<String, ToolPermission>>,
    session: std::sync::Mutex<SessionGrants>,
    pending: DashMap<Uuid, PendingEntry>,
    store: Box<dyn GrantStore>,
    events: EventBus,
    expiry_tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl PermissionEngine {
    /// Build an engine, loading persisted grants from the store.
    pub async fn new(
        settings: PermissionSettings,
        store: Box<dyn GrantStore>,
        events: EventBus,
    ) -> anyhow::Result<Self> {
        settings.validate()?;

        let mut grants = HashMap::new();
        for grant in store.load().await? {
            grants.insert(grant.key(), grant);
        }

        let engine = Self {
            session: std::sync::Mutex::new(SessionGrants::new(settings.max_session_grants)),
            settings: RwLock::new(settings),
            grants: RwLock::new(grants),
            pending: DashMap::new(),
            store,
            events,
            expiry_tasks: std::sync::Mutex::new(Vec::new()),
        };

        let loaded: Vec<ToolPermission> =
            engine.grants.read().await.values().cloned().collect();
        for grant in &loaded {
            engine.schedule_expiry_warning(grant);
        }

        Ok(engine)
    }

    /// Decide whether a tool invocation may proceed. Suspends on the
    /// interactive path until a decision or the configured timeout arrives.
    pub async fn authorize(
        &self,
        server_id: &str,
        server_name: &str,
        tool: &ToolDescriptor,
        args: &Value,
    ) -> Result<(), McpError> {
        let settings = self.settings.read().await.clone();
        let key = grant_key(server_id, &tool.name);
        let now = Utc::now();

        // Path 1: stored persistent grant.
        let stored = { self.grants.read().await.get(&key).cloned() };
        if let Some(grant) = stored {
            if grant.is_expired(now) {
                tracing::info!(key = %key, "stored grant expired, discarding");
                self.remove_grant(&key).await;
            } else if grant.permission == PermissionRule::Deny {
                tracing::info!(key = %key, "tool call blocked by stored deny rule");
                return Err(denied(&tool.name, "blocked by a stored deny rule"));
            } else if grant.matches_arguments(args, settings.validate_arguments) {
                self.touch_grant(&key, now).await;
                tracing::debug!(key = %key, "allowed by stored grant");
                return Ok(());
            } else {
                tracing::info!(key = %key, "stored grant does not cover these arguments, discarding");
                self.remove_grant(&key).await;
            }
        }

        // Path 2: session grant. A tool-wide grant covers argument-specific
        // calls, so both keys are checked.
        let fingerprint = argument_fingerprint(args);
        {
            let session = self.session.lock().unwrap();
            if session.contains(&session_key(server_id, &tool.name, Some(&fingerprint)))
                || session.contains(&session_key(server_id, &tool.name, None))
            {
                tracing::debug!(server = %server_id, tool = %tool.name, "allowed by session grant");
                return Ok(());
            }
        }

        // Path 3: risk assessment and auto-approval.
        let assessment = risk::assess(tool, args, &settings);
        let trusted = settings.trusted_servers.contains(server_id);
        let auto_approved = trusted
            || settings
                .auto_approve_max_risk
                .map(|ceiling| assessment.level <= ceiling)
                .unwrap_or(false);

        if auto_approved {
            self.record_session_grant(session_key(server_id, &tool.name, Some(&fingerprint)));
            tracing::info!(
                server = %server_id,
                tool = %tool.name,
                risk = %assessment.level.label(),
                trusted,
                "tool call auto-approved"
            );
            return Ok(());
        }

        // Path 4: interactive approval.
        self.request_approval(server_id, server_name, tool, args, assessment, &settings, now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn request_approval(
        &self,
        server_id: &str,
        server_name: &str,
        tool: &ToolDescriptor,
        args: &Value,
        assessment: RiskAssessment,
        settings: &PermissionSettings,
        now: DateTime<Utc>,
    ) -> Result<(), McpError> {
        let info = PendingApproval {
            id: Uuid::new_v4(),
            server_id: server_id.to_string(),
            server_name: server_name.to_string(),
            tool_name: tool.name.clone(),
            tool_description: tool.description.clone(),
            args: args.clone(),
            risk: assessment.clone(),
            requested_at: now,
        };
        let id = info.id;

        let (responder, receiver) = oneshot::channel();
        self.pending.insert(
            id,
            PendingEntry {
                info: info.clone(),
                responder,
            },
        );
        self.events.emit(Event::PermissionRequested(info));

        tracing::info!(
            id = %id,
            server = %server_id,
            tool = %tool.name,
            risk = %assessment.level.label(),
            "approval requested"
        );

        let response = match timeout(settings.approval_timeout(), receiver).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                // Responder dropped without answering, e.g. during shutdown
                // teardown races. Treated as denial.
                self.pending.remove(&id);
                return Err(denied(&tool.name, "approval request was cancelled"));
            }
            Err(_) => {
                self.pending.remove(&id);
                tracing::info!(id = %id, tool = %tool.name, "approval request timed out");
                return Err(denied(&tool.name, "approval request timed out"));
            }
        };

        if !response.approved {
            if response.scope == GrantScope::Always {
                let grant = self.build_persistent_grant(
                    server_id,
                    &tool.name,
                    PermissionRule::Deny,
                    assessment.level,
                    args,
                    settings,
                    now,
                );
                self.store_grant(grant).await;
            }
            tracing::info!(id = %id, tool = %tool.name, "tool call denied by user");
            return Err(denied(&tool.name, "denied by user"));
        }

        match response.scope {
            GrantScope::Once => {}
            GrantScope::Session => {
                // User-approved session grants are tool-wide; they cover
                // later calls with any arguments.
                self.record_session_grant(session_key(server_id, &tool.name, None));
            }
            GrantScope::Always => {
                let grant = self.build_persistent_grant(
                    server_id,
                    &tool.name,
                    PermissionRule::Allow,
                    assessment.level,
                    args,
                    settings,
                    now,
                );
                self.store_grant(grant).await;
            }
        }

        tracing::info!(id = %id, tool = %tool.name, scope = ?response.scope, "tool call approved");
        Ok(())
    }

    /// Settle a pending approval. Returns false if the id is unknown,
    /// which includes approvals that already timed out.
    pub fn respond_to_approval(&self, id: Uuid, response: ApprovalResponse) -> bool {
        match self.pending.remove(&id) {
            Some((_, entry)) => {
                let _ = entry.responder.send(response);
                true
            }
            None => false,
        }
    }

    /// Approvals currently awaiting a decision.
    pub fn pending_approvals(&self) -> Vec<PendingApproval> {
        self.pending.iter().map(|e| e.value().info.clone()).collect()
    }

    /// Remove all grants already past expiry. Returns the count removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut grants = self.grants.write().await;
            let before = grants.len();
            grants.retain(|_, grant| !grant.is_expired(now));
            before - grants.len()
        };

        if removed > 0 {
            self.persist_grants().await;
            tracing::info!(removed, "purged expired grants");
        }
        removed
    }

    pub async fn list_grants(&self) -> Vec<ToolPermission> {
        self.grants.read().await.values().cloned().collect()
    }

    /// Delete a stored grant. Returns whether one existed.
    pub async fn revoke_grant(&self, server_id: &str, tool_name: &str) -> bool {
        let key = grant_key(server_id, tool_name);
        let removed = self.grants.write().await.remove(&key).is_some();
        if removed {
            self.persist_grants().await;
            tracing::info!(key = %key, "grant revoked");
        }
        removed
    }

    pub fn clear_session_grants(&self) {
        self.session.lock().unwrap().clear();
    }

    pub fn session_grant_count(&self) -> usize {
        self.session.lock().unwrap().len()
    }

    pub async fn settings(&self) -> PermissionSettings {
        self.settings.read().await.clone()
    }

    /// Replace the policy. The session-grant cap applies immediately.
    pub async fn update_settings(&self, settings: PermissionSettings) -> anyhow::Result<()> {
        settings.validate()?;
        self.session
            .lock()
            .unwrap()
            .set_capacity(settings.max_session_grants);
        *self.settings.write().await = settings;
        Ok(())
    }

    /// Deny every pending approval and drop scheduled expiry timers.
    /// Safe to call with authorization flows still in flight.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                let _ = entry.responder.send(ApprovalResponse::deny());
            }
        }

        for handle in self.expiry_tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_persistent_grant(
        &self,
        server_id: &str,
        tool_name: &str,
        permission: PermissionRule,
        risk_level: RiskLevel,
        args: &Value,
        settings: &PermissionSettings,
        now: DateTime<Utc>,
    ) -> ToolPermission {
        let (allowed_paths, allowed_domains) = security_context(args);

        ToolPermission {
            server_id: server_id.to_string(),
            tool_name: tool_name.to_string(),
            permission,
            scope: GrantScope::Always,
            risk_level,
            granted_at: now,
            expires_at: settings.grant_lifetime().map(|lifetime| now + lifetime),
            allowed_paths,
            allowed_domains,
            argument_pattern: if settings.validate_arguments {
                Some(argument_fingerprint(args))
            } else {
                None
            },
            usage_count: 0,
            last_used: now,
        }
    }

    async fn store_grant(&self, grant: ToolPermission) {
        self.schedule_expiry_warning(&grant);
        self.grants.write().await.insert(grant.key(), grant);
        self.persist_grants().await;
    }

    async fn touch_grant(&self, key: &str, now: DateTime<Utc>) {
        {
            let mut grants = self.grants.write().await;
            if let Some(grant) = grants.get_mut(key) {
                grant.usage_count += 1;
                grant.last_used = now;
            }
        }
        self.persist_grants().await;
    }

    async fn remove_grant(&self, key: &str) {
        self.grants.write().await.remove(key);
        self.persist_grants().await;
    }

    async fn persist_grants(&self) {
        let grants: Vec<ToolPermission> = self.grants.read().await.values().cloned().collect();
        if let Err(e) = self.store.persist(&grants).await {
            tracing::warn!(error = %e, "failed to persist grants");
        }
    }

    fn record_session_grant(&self, key: String) {
        let mut session = self.session.lock().unwrap();
        if let Some(evicted) = session.insert(key) {
            tracing::debug!(evicted = %evicted, "evicted oldest session grant");
        }
    }

    /// Emit a `GrantExpiring` event one day before expiry. Suppressed when
    /// less than a day remains; best-effort only.
    fn schedule_expiry_warning(&self, grant: &ToolPermission) {
        let Some(expires_at) = grant.expires_at else {
            return;
        };

        let warn_at = expires_at - chrono::Duration::days(1);
        let now = Utc::now();
        if warn_at <= now {
            return;
        }
        let Ok(delay) = (warn_at - now).to_std() else {
            return;
        };

        let events = self.events.clone();
        let server_id = grant.server_id.clone();
        let tool_name = grant.tool_name.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            events.emit(Event::GrantExpiring {
                server_id,
                tool_name,
                expires_at,
            });
        });
        self.expiry_tasks.lock().unwrap().push(handle);
    }
}

fn denied(tool: &str, reason: &str) -> McpError {
    McpError::PermissionDenied {
        tool: tool.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::grants::MemoryGrantStore;
    use serde_json::json;
    use std::sync::Arc;

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            server_id: "srv".into(),
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
        }
    }

    async fn engine_with(settings: PermissionSettings) -> Arc<PermissionEngine> {
        Arc::new(
            PermissionEngine::new(settings, Box::new(MemoryGrantStore::default()), EventBus::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_low_risk_auto_approved_by_default() {
        let engine = engine_with(PermissionSettings::default()).await;
        let result = engine
            .authorize("srv", "Server", &tool("echo", "Repeats input"), &json!({}))
            .await;
        assert!(result.is_ok());
        assert_eq!(engine.session_grant_count(), 1);
    }

    #[tokio::test]
    async fn test_trusted_server_skips_prompt() {
        let mut settings = PermissionSettings::strict();
        settings.trusted_servers.insert("srv".into());
        let engine = engine_with(settings).await;

        let result = engine
            .authorize(
                "srv",
                "Server",
                &tool("run", "Execute a shell command"),
                &json!({}),
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stored_deny_rule_rejects_immediately() {
        let mut settings = PermissionSettings::strict();
        settings.approval_timeout_secs = 1;
        let now = Utc::now();
        let deny = ToolPermission {
            server_id: "srv".into(),
            tool_name: "run".into(),
            permission: PermissionRule::Deny,
            scope: GrantScope::Always,
            risk_level: RiskLevel::High,
            granted_at: now,
            expires_at: None,
            allowed_paths: None,
            allowed_domains: None,
            argument_pattern: None,
            usage_count: 0,
            last_used: now,
        };
        let engine = Arc::new(
            PermissionEngine::new(
                settings,
                Box::new(MemoryGrantStore::with_grants(vec![deny])),
                EventBus::default(),
            )
            .await
            .unwrap(),
        );

        let err = engine
            .authorize("srv", "Server", &tool("run", "shell"), &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn test_respond_unknown_id_is_false() {
        let engine = engine_with(PermissionSettings::default()).await;
        assert!(!engine.respond_to_approval(Uuid::new_v4(), ApprovalResponse::approve_once()));
    }

    #[tokio::test]
    async fn test_purge_expired_counts_removals() {
        let now = Utc::now();
        let expired = ToolPermission {
            server_id: "srv".into(),
            tool_name: "old".into(),
            permission: PermissionRule::Allow,
            scope: GrantScope::Always,
            risk_level: RiskLevel::Low,
            granted_at: now - chrono::Duration::days(40),
            expires_at: Some(now - chrono::Duration::days(10)),
            allowed_paths: None,
            allowed_domains: None,
            argument_pattern: None,
            usage_count: 3,
            last_used: now - chrono::Duration::days(11),
        };
        let valid = ToolPermission {
            tool_name: "fresh".into(),
            expires_at: Some(now + chrono::Duration::days(10)),
            ..expired.clone()
        };

        let engine = Arc::new(
            PermissionEngine::new(
                PermissionSettings::default(),
                Box::new(MemoryGrantStore::with_grants(vec![expired, valid])),
                EventBus::default(),
            )
            .await
            .unwrap(),
        );

        assert_eq!(engine.purge_expired().await, 1);
        let remaining = engine.list_grants().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tool_name, "fresh");
    }

    #[tokio::test]
    async fn test_update_settings_rejects_invalid() {
        let engine = engine_with(PermissionSettings::default()).await;
        let bad = PermissionSettings {
            max_session_grants: 0,
            ..Default::default()
        };
        assert!(engine.update_settings(bad).await.is_err());
    }
}
