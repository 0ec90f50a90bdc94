//! Process-wide permission policy.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use super::risk::RiskLevel;

/// Policy knobs consulted on every tool invocation.
///
/// Constructed once with secure defaults and mutated only through the
/// engine's settings-update operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionSettings {
    /// Highest risk level granted implicitly; `None` disables auto-approval.
    #[serde(default = "default_auto_approve")]
    pub auto_approve_max_risk: Option<RiskLevel>,

    /// Weigh file-system keywords as approval-worthy.
    #[serde(default = "default_true")]
    pub require_approval_for_file_access: bool,

    /// Weigh network keywords as approval-worthy.
    #[serde(default = "default_true")]
    pub require_approval_for_network: bool,

    /// Weigh command-execution keywords as approval-worthy.
    #[serde(default = "default_true")]
    pub require_approval_for_system_commands: bool,

    /// Servers whose tools are granted without assessment.
    #[serde(default)]
    pub trusted_servers: HashSet<String>,

    /// Lifetime of persistent grants in days; 0 means grants never expire.
    #[serde(default = "default_grant_lifetime_days")]
    pub grant_lifetime_days: u32,

    /// Check stored argument patterns when reusing a persistent grant.
    #[serde(default = "default_true")]
    pub validate_arguments: bool,

    /// Cap on concurrent session grants; exceeding it evicts the oldest.
    #[serde(default = "default_max_session_grants")]
    pub max_session_grants: usize,

    /// Seconds before an unanswered approval resolves to denial.
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
}

impl Default for PermissionSettings {
    fn default() -> Self {
        Self {
            auto_approve_max_risk: default_auto_approve(),
            require_approval_for_file_access: true,
            require_approval_for_network: true,
            require_approval_for_system_commands: true,
            trusted_servers: HashSet::new(),
            grant_lifetime_days: default_grant_lifetime_days(),
            validate_arguments: true,
            max_session_grants: default_max_session_grants(),
            approval_timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl PermissionSettings {
    /// Everything prompts; nothing is granted implicitly.
    pub fn strict() -> Self {
        Self {
            auto_approve_max_risk: None,
            ..Self::default()
        }
    }

    /// Auto-approve up to medium risk. Useful for development setups.
    pub fn permissive() -> Self {
        Self {
            auto_approve_max_risk: Some(RiskLevel::Medium),
            ..Self::default()
        }
    }

    /// Validate the configuration and return errors if invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_session_grants == 0 {
            return Err(anyhow::anyhow!("maxSessionGrants must be at least 1"));
        }

        if self.approval_timeout_secs == 0 {
            return Err(anyhow::anyhow!("approvalTimeoutSecs must be at least 1"));
        }

        if self.grant_lifetime_days > 365 {
            return Err(anyhow::anyhow!(
                "grantLifetimeDays should not exceed one year"
            ));
        }

        Ok(())
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    /// Grant lifetime as a chrono duration, `None` when expiry is disabled.
    pub fn grant_lifetime(&self) -> Option<chrono::Duration> {
        if self.grant_lifetime_days == 0 {
            None
        } else {
            Some(chrono::Duration::days(i64::from(self.grant_lifetime_days)))
        }
    }
}

fn default_auto_approve() -> Option<RiskLevel> {
    Some(RiskLevel::Low)
}

fn default_true() -> bool {
    true
}

fn default_grant_lifetime_days() -> u32 {
    30
}

fn default_max_session_grants() -> usize {
    50
}

fn default_approval_timeout_secs() -> u64 {
    30
}
