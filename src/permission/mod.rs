//! Permission engine: grants, risk assessment, and interactive approval.

pub mod approval;
pub mod engine;
pub mod grants;
pub mod risk;
pub mod settings;

pub use approval::{ApprovalResponse, PendingApproval};
pub use engine::PermissionEngine;
pub use grants::{
    argument_fingerprint, FileGrantStore, GrantScope, GrantStore, MemoryGrantStore,
    PermissionRule, ToolPermission,
};
pub use risk::{RiskAssessment, RiskLevel};
pub use settings::PermissionSettings;
