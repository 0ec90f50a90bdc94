//! Keyword-based risk classification for tool invocations.
//!
//! The classifier inspects the tool's name, description, and a lowercased
//! dump of its arguments. Scores are additive across keyword families, so
//! matching an extra family can never lower the resulting level.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::settings::PermissionSettings;
use crate::mcp::types::ToolDescriptor;

/// Coarse classification driving auto-approval and prompting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Outcome of one assessment: the level plus the reasons behind it, so an
/// approval prompt can explain *why*.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub score: u32,
    pub reasons: Vec<String>,
}

const FILE_TERMS: [&str; 5] = ["file", "directory", "folder", "path", "disk"];
const NETWORK_TERMS: [&str; 6] = ["http", "url", "fetch", "download", "upload", "network"];
const EXEC_TERMS: [&str; 5] = ["exec", "command", "shell", "spawn", "process"];
const MUTATION_TERMS: [&str; 3] = ["delete", "modify", "update"];
const SENSITIVE_TERMS: [&str; 4] = ["password", "token", "secret", "key"];

fn contains_any(haystack: &str, terms: &[&str]) -> bool {
    terms.iter().any(|term| haystack.contains(term))
}

/// Score a tool invocation against the configured policy.
pub fn assess(tool: &ToolDescriptor, args: &Value, settings: &PermissionSettings) -> RiskAssessment {
    let haystack = format!("{} {} {}", tool.name, tool.description, args).to_lowercase();

    let mut score = 0u32;
    let mut reasons = Vec::new();

    if contains_any(&haystack, &FILE_TERMS) {
        score += if settings.require_approval_for_file_access { 2 } else { 1 };
        reasons.push("accesses the file system".to_string());
    }

    if contains_any(&haystack, &NETWORK_TERMS) {
        score += if settings.require_approval_for_network { 2 } else { 1 };
        reasons.push("performs network access".to_string());
    }

    if contains_any(&haystack, &EXEC_TERMS) {
        score += if settings.require_approval_for_system_commands { 3 } else { 2 };
        reasons.push("executes commands or spawns processes".to_string());
    }

    if contains_any(&haystack, &MUTATION_TERMS) {
        score += 2;
        reasons.push("mutates existing data".to_string());
    }

    if contains_any(&haystack, &SENSITIVE_TERMS) {
        score += 3;
        reasons.push("handles sensitive data".to_string());
    }

    let level = match score {
        s if s >= 4 => RiskLevel::High,
        s if s >= 2 => RiskLevel::Medium,
        _ => RiskLevel::Low,
    };

    if reasons.is_empty() {
        reasons.push("general tool execution".to_string());
    }

    RiskAssessment { level, score, reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor {
            server_id: "test".into(),
            name: name.into(),
            description: description.into(),
            input_schema: Value::Null,
        }
    }

    fn defaults() -> PermissionSettings {
        PermissionSettings::default()
    }

    #[test]
    fn test_benign_tool_is_low() {
        let assessment = assess(&tool("echo", "Repeats its input"), &json!({}), &defaults());
        assert_eq!(assessment.level, RiskLevel::Low);
        assert_eq!(assessment.reasons, vec!["general tool execution"]);
    }

    #[test]
    fn test_file_terms_score() {
        let assessment = assess(
            &tool("read_file", "Read a file from disk"),
            &json!({}),
            &defaults(),
        );
        assert_eq!(assessment.level, RiskLevel::Medium);
        assert!(assessment
            .reasons
            .iter()
            .any(|r| r.contains("file system")));
    }

    #[test]
    fn test_shell_plus_mutation_is_high() {
        let assessment = assess(
            &tool("run", "Execute a shell command to delete entries"),
            &json!({}),
            &defaults(),
        );
        assert!(assessment.score >= 4);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    #[test]
    fn test_arguments_are_inspected() {
        let assessment = assess(
            &tool("store", "Persist a value"),
            &json!({"value": "my api TOKEN"}),
            &defaults(),
        );
        assert!(assessment.reasons.iter().any(|r| r.contains("sensitive")));
        assert_eq!(assessment.level, RiskLevel::Medium);
    }

    #[test]
    fn test_relaxed_categories_score_lower() {
        let mut settings = defaults();
        settings.require_approval_for_file_access = false;

        let strict = assess(&tool("read_file", "Read a file"), &json!({}), &defaults());
        let relaxed = assess(&tool("read_file", "Read a file"), &json!({}), &settings);
        assert!(relaxed.score < strict.score);
    }

    #[test]
    fn test_reasons_accumulate() {
        let assessment = assess(
            &tool("sync", "Upload a file over http and update the secret token"),
            &json!({}),
            &defaults(),
        );
        assert!(assessment.reasons.len() >= 4);
        assert_eq!(assessment.level, RiskLevel::High);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Appending a keyword from any family must never lower the level.
            #[test]
            fn risk_is_monotonic(
                base in "[a-z ]{0,40}",
                family in 0usize..5,
                term in 0usize..3,
            ) {
                let families: [&[&str]; 5] = [
                    &FILE_TERMS,
                    &NETWORK_TERMS,
                    &EXEC_TERMS,
                    &MUTATION_TERMS,
                    &SENSITIVE_TERMS,
                ];
                let keyword = families[family][term % families[family].len()];
                let settings = PermissionSettings::default();

                let before = assess(&tool("probe", &base), &json!({}), &settings);
                let augmented = format!("{} {}", base, keyword);
                let after = assess(&tool("probe", &augmented), &json!({}), &settings);

                prop_assert!(after.level >= before.level);
                prop_assert!(after.score >= before.score);
            }
        }
    }
}
