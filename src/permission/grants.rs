//! Grant records, grant stores, and argument fingerprinting.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use url::Url;

use super::risk::RiskLevel;

/// Stored decision for a `(server, tool)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionRule {
    Allow,
    Deny,
}

/// How long an approval holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantScope {
    /// This one execution only.
    Once,
    /// Until the process exits.
    Session,
    /// Persisted, with optional expiry.
    Always,
}

/// A persisted grant. Created when an approval is stored with scope
/// `always`; usage counters are updated on every matching reuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPermission {
    pub server_id: String,
    pub tool_name: String,
    pub permission: PermissionRule,
    pub scope: GrantScope,
    pub risk_level: RiskLevel,
    pub granted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Path prefixes the grant is limited to, seeded from a `path` argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_paths: Option<Vec<String>>,
    /// Hostnames the grant is limited to, seeded from a `url` argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domains: Option<Vec<String>>,
    /// Fingerprint of the approved arguments, checked when argument
    /// validation is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_pattern: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    pub last_used: DateTime<Utc>,
}

impl ToolPermission {
    pub fn key(&self) -> String {
        grant_key(&self.server_id, &self.tool_name)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| now > e).unwrap_or(false)
    }

    /// Check whether this grant covers the given arguments. The stored
    /// fingerprint is only consulted when argument validation is enabled;
    /// path and domain allow-lists always apply when present.
    pub fn matches_arguments(&self, args: &Value, validate_arguments: bool) -> bool {
        if validate_arguments {
            if let Some(pattern) = &self.argument_pattern {
                if *pattern != argument_fingerprint(args) {
                    return false;
                }
            }
        }

        if let Some(allowed) = &self.allowed_paths {
            if let Some(path) = args.get("path").and_then(Value::as_str) {
                if !allowed.iter().any(|prefix| path.starts_with(prefix)) {
                    return false;
                }
            }
        }

        if let Some(allowed) = &self.allowed_domains {
            if let Some(raw) = args.get("url").and_then(Value::as_str) {
                let host = Url::parse(raw)
                    .ok()
                    .and_then(|u| u.host_str().map(str::to_string));
                match host {
                    Some(host) if allowed.iter().any(|d| *d == host) => {}
                    _ => return false,
                }
            }
        }

        true
    }
}

/// Persistent-grant key: one grant per tool per server.
pub fn grant_key(server_id: &str, tool_name: &str) -> String {
    format!("{}:{}", server_id, tool_name)
}

/// Session-grant key. With a fingerprint the grant covers one argument
/// shape; without it the grant covers the whole tool.
pub fn session_key(server_id: &str, tool_name: &str, fingerprint: Option<&str>) -> String {
    match fingerprint {
        Some(fp) => format!("session:{}:{}:{}", server_id, tool_name, fp),
        None => format!("session:{}:{}", server_id, tool_name),
    }
}

/// Fingerprint length in base64 characters. Covers small argument objects
/// exactly; large ones only by prefix. A heuristic equality check, not a
/// cryptographic commitment.
const FINGERPRINT_LEN: usize = 32;

/// Order-independent fingerprint of an argument object: sorted-key JSON,
/// base64-encoded, truncated.
pub fn argument_fingerprint(args: &Value) -> String {
    // serde_json keeps object keys in a sorted map, so serialization is
    // already canonical regardless of insertion order.
    let canonical = args.to_string();
    let encoded = URL_SAFE_NO_PAD.encode(canonical.as_bytes());
    encoded.chars().take(FINGERPRINT_LEN).collect()
}

/// Security context extracted from arguments when storing an always-grant.
pub fn security_context(args: &Value) -> (Option<Vec<String>>, Option<Vec<String>>) {
    let paths = args
        .get("path")
        .and_then(Value::as_str)
        .map(|p| vec![p.to_string()]);

    let domains = args
        .get("url")
        .and_then(Value::as_str)
        .and_then(|raw| Url::parse(raw).ok())
        .and_then(|url| url.host_str().map(|h| vec![h.to_string()]));

    (paths, domains)
}

/// Session grants held for the lifetime of the process. Bounded; inserting
/// past the cap evicts the oldest entry by insertion order, not by use.
#[derive(Debug)]
pub(crate) struct SessionGrants {
    entries: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl SessionGrants {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains(key)
    }

    /// Insert a key, returning the evicted key if the cap was hit.
    /// Re-inserting an existing key does not change its position.
    pub fn insert(&mut self, key: String) -> Option<String> {
        if self.entries.contains(&key) {
            return None;
        }

        let evicted = if self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                    Some(oldest)
                }
                None => None,
            }
        } else {
            None
        };

        self.entries.insert(key.clone());
        self.order.push_back(key);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Shrink or grow the cap, evicting oldest entries if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }
}

/// Persistence seam for always-grants. The engine keeps grants in memory
/// and hands the full set to the store after every mutation.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ToolPermission>>;
    async fn persist(&self, grants: &[ToolPermission]) -> Result<()>;
}

/// In-memory store for tests and ephemeral setups.
#[derive(Default)]
pub struct MemoryGrantStore {
    grants: std::sync::Mutex<Vec<ToolPermission>>,
}

impl MemoryGrantStore {
    pub fn with_grants(grants: Vec<ToolPermission>) -> Self {
        Self {
            grants: std::sync::Mutex::new(grants),
        }
    }
}

#[async_trait]
impl GrantStore for MemoryGrantStore {
    async fn load(&self) -> Result<Vec<ToolPermission>> {
        Ok(self.grants.lock().unwrap().clone())
    }

    async fn persist(&self, grants: &[ToolPermission]) -> Result<()> {
        *self.grants.lock().unwrap() = grants.to_vec();
        Ok(())
    }
}

/// JSON-file store.
pub struct FileGrantStore {
    path: PathBuf,
}

impl FileGrantStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl GrantStore for FileGrantStore {
    async fn load(&self) -> Result<Vec<ToolPermission>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        serde_json::from_str(&content).context("Failed to parse grant file")
    }

    async fn persist(&self, grants: &[ToolPermission]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(grants)?;
        std::fs::write(&self.path, content)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(())
    }
}
