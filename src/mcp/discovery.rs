//! Capability discovery: enumerating a server's tools, resources, and
//! prompts after the initialize handshake.
//!
//! Catalogs are replaceable snapshots. Every descriptor is stamped with the
//! owning server's id before it leaves this module.

use serde_json::Value;

use super::transport::{Transport, TransportError};
use super::types::{PromptDescriptor, ResourceDescriptor, ServerCapabilities, ToolDescriptor};

/// Everything a server advertised in one discovery round.
#[derive(Debug, Clone, Default)]
pub struct Catalogs {
    pub tools: Vec<ToolDescriptor>,
    pub resources: Vec<ResourceDescriptor>,
    pub prompts: Vec<PromptDescriptor>,
}

/// Query the catalogs the advertised capabilities allow. A capability the
/// server did not advertise contributes an empty catalog; a failed list
/// call fails the whole round.
pub async fn discover(
    server_id: &str,
    capabilities: &ServerCapabilities,
    transport: &dyn Transport,
) -> Result<Catalogs, TransportError> {
    let mut catalogs = Catalogs::default();

    if capabilities.tools.is_some() {
        let result = transport.request("tools/list", None).await?;
        catalogs.tools = parse_tools(server_id, &result);
    }

    if capabilities.resources.is_some() {
        let result = transport.request("resources/list", None).await?;
        catalogs.resources = parse_resources(server_id, &result);
    }

    if capabilities.prompts.is_some() {
        let result = transport.request("prompts/list", None).await?;
        catalogs.prompts = parse_prompts(server_id, &result);
    }

    tracing::info!(
        server = %server_id,
        tools = catalogs.tools.len(),
        resources = catalogs.resources.len(),
        prompts = catalogs.prompts.len(),
        "capability discovery complete"
    );

    Ok(catalogs)
}

pub fn parse_tools(server_id: &str, result: &Value) -> Vec<ToolDescriptor> {
    let mut tools: Vec<ToolDescriptor> = result
        .get("tools")
        .and_then(|t| serde_json::from_value(t.clone()).ok())
        .unwrap_or_default();
    for tool in &mut tools {
        tool.server_id = server_id.to_string();
    }
    tools
}

pub fn parse_resources(server_id: &str, result: &Value) -> Vec<ResourceDescriptor> {
    let mut resources: Vec<ResourceDescriptor> = result
        .get("resources")
        .and_then(|r| serde_json::from_value(r.clone()).ok())
        .unwrap_or_default();
    for resource in &mut resources {
        resource.server_id = server_id.to_string();
    }
    resources
}

pub fn parse_prompts(server_id: &str, result: &Value) -> Vec<PromptDescriptor> {
    let mut prompts: Vec<PromptDescriptor> = result
        .get("prompts")
        .and_then(|p| serde_json::from_value(p.clone()).ok())
        .unwrap_or_default();
    for prompt in &mut prompts {
        prompt.server_id = server_id.to_string();
    }
    prompts
}
