//! Pending approvals and the response protocol.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::grants::GrantScope;
use super::risk::RiskAssessment;

/// An in-flight request for a human decision on a tool call.
///
/// Published once on the event bus; the UI layer settles it by calling
/// `respond_to_approval` with the same id before the timeout elapses.
#[derive(Debug, Clone)]
pub struct PendingApproval {
    pub id: Uuid,
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
    pub tool_description: String,
    pub args: Value,
    pub risk: RiskAssessment,
    pub requested_at: DateTime<Utc>,
}

/// The human decision on a pending approval.
#[derive(Debug, Clone)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub scope: GrantScope,
}

impl ApprovalResponse {
    /// Approve this one execution only.
    pub fn approve_once() -> Self {
        Self {
            approved: true,
            scope: GrantScope::Once,
        }
    }

    /// Approve the tool for the rest of the session.
    pub fn approve_session() -> Self {
        Self {
            approved: true,
            scope: GrantScope::Session,
        }
    }

    /// Approve and persist a grant.
    pub fn approve_always() -> Self {
        Self {
            approved: true,
            scope: GrantScope::Always,
        }
    }

    /// Deny this execution.
    pub fn deny() -> Self {
        Self {
            approved: false,
            scope: GrantScope::Once,
        }
    }

    /// Deny and persist a deny rule.
    pub fn deny_always() -> Self {
        Self {
            approved: false,
            scope: GrantScope::Always,
        }
    }
}

/// Map entry for an unsettled approval. The responder resolves the waiting
/// caller; dropping it unresolved reads as denial on the waiting side.
pub(crate) struct PendingEntry {
    pub info: PendingApproval,
    pub responder: oneshot::Sender<ApprovalResponse>,
}
