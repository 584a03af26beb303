use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::future::join_all;
use rmcp::model::{Prompt, Resource, Tool};

use crate::events::{EventBus, ProxyEvent};
use crate::outbound::OutboundRegistry;

const PER_SERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct OwnedTool {
    pub server: String,
    pub tool: Tool,
}

#[derive(Debug, Clone)]
pub struct OwnedResource {
    pub server: String,
    pub resource: Resource,
}

#[derive(Debug, Clone)]
pub struct OwnedPrompt {
    pub server: String,
    pub prompt: Prompt,
}

/// Immutable union of capabilities across Ready outbound servers.
///
/// Within each category keys are unique: on collision the first server in
/// `ready_server_names` lexical order wins, so two snapshots built from the
/// same inputs are identical regardless of connection order.
#[derive(Debug, Default, Clone)]
pub struct CapabilitySnapshot {
    pub tools: Vec<OwnedTool>,
    pub resources: Vec<OwnedResource>,
    pub prompts: Vec<OwnedPrompt>,
    pub ready_server_names: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CapabilitySnapshot {
    pub fn tool_owner(&self, name: &str) -> Option<&OwnedTool> {
        self.tools.iter().find(|t| t.tool.name == name)
    }

    pub fn resource_owner(&self, uri: &str) -> Option<&OwnedResource> {
        self.resources.iter().find(|r| r.resource.raw.uri == uri)
    }

    pub fn prompt_owner(&self, name: &str) -> Option<&OwnedPrompt> {
        self.prompts.iter().find(|p| p.prompt.name == name)
    }

    fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.tool.name.as_ref()).collect()
    }

    fn resource_uris(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.resource.raw.uri.as_str()).collect()
    }

    fn prompt_names(&self) -> Vec<&str> {
        self.prompts.iter().map(|p| p.prompt.name.as_str()).collect()
    }
}

/// What changed between two consecutive snapshots.
#[derive(Debug, Default, Clone)]
pub struct CapabilityChanges {
    pub tools_changed: bool,
    pub resources_changed: bool,
    pub prompts_changed: bool,
    pub added_servers: Vec<String>,
    pub removed_servers: Vec<String>,
}

impl CapabilityChanges {
    pub fn is_empty(&self) -> bool {
        !self.tools_changed
            && !self.resources_changed
            && !self.prompts_changed
            && self.added_servers.is_empty()
            && self.removed_servers.is_empty()
    }
}

/// Compare the sorted name/uri lists of two snapshots.
pub fn diff(prev: &CapabilitySnapshot, curr: &CapabilitySnapshot) -> CapabilityChanges {
    let mut changes = CapabilityChanges {
        tools_changed: prev.tool_names() != curr.tool_names(),
        resources_changed: prev.resource_uris() != curr.resource_uris(),
        prompts_changed: prev.prompt_names() != curr.prompt_names(),
        ..Default::default()
    };
    for name in &curr.ready_server_names {
        if !prev.ready_server_names.contains(name) {
            changes.added_servers.push(name.clone());
        }
    }
    for name in &prev.ready_server_names {
        if !curr.ready_server_names.contains(name) {
            changes.removed_servers.push(name.clone());
        }
    }
    changes
}

/// Per-server listing result fed into snapshot assembly.
#[derive(Debug, Default, Clone)]
pub struct ServerCapabilityListing {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

/// Deterministic snapshot assembly from per-server listings. Separated from
/// the querying so the de-duplication policy is testable on its own.
pub fn assemble_snapshot(
    listings: BTreeMap<String, ServerCapabilityListing>,
) -> CapabilitySnapshot {
    let mut tools: BTreeMap<String, OwnedTool> = BTreeMap::new();
    let mut resources: BTreeMap<String, OwnedResource> = BTreeMap::new();
    let mut prompts: BTreeMap<String, OwnedPrompt> = BTreeMap::new();

    // BTreeMap iteration gives lexical server order, so the first writer
    // for a key is the lexicographically smallest ready server.
    for (server, listing) in &listings {
        for tool in &listing.tools {
            let key = tool.name.to_string();
            if let Some(existing) = tools.get(&key) {
                tracing::debug!(
                    target = "aggregator",
                    tool = %key,
                    winner = %existing.server,
                    loser = %server,
                    "duplicate tool name"
                );
                continue;
            }
            tools.insert(
                key,
                OwnedTool {
                    server: server.clone(),
                    tool: tool.clone(),
                },
            );
        }
        for resource in &listing.resources {
            let key = resource.raw.uri.clone();
            if let Some(existing) = resources.get(&key) {
                tracing::debug!(
                    target = "aggregator",
                    uri = %key,
                    winner = %existing.server,
                    loser = %server,
                    "duplicate resource uri"
                );
                continue;
            }
            resources.insert(
                key,
                OwnedResource {
                    server: server.clone(),
                    resource: resource.clone(),
                },
            );
        }
        for prompt in &listing.prompts {
            let key = prompt.name.clone();
            if let Some(existing) = prompts.get(&key) {
                tracing::debug!(
                    target = "aggregator",
                    prompt = %key,
                    winner = %existing.server,
                    loser = %server,
                    "duplicate prompt name"
                );
                continue;
            }
            prompts.insert(
                key,
                OwnedPrompt {
                    server: server.clone(),
                    prompt: prompt.clone(),
                },
            );
        }
    }

    CapabilitySnapshot {
        tools: tools.into_values().collect(),
        resources: resources.into_values().collect(),
        prompts: prompts.into_values().collect(),
        ready_server_names: listings.into_keys().collect(),
        timestamp: chrono::Utc::now(),
    }
}

/// Rebuilds capability snapshots from Ready connections and publishes the
/// diff of each rebuild.
pub struct CapabilityAggregator {
    registry: Arc<OutboundRegistry>,
    events: EventBus,
    snapshot: RwLock<Arc<CapabilitySnapshot>>,
}

impl CapabilityAggregator {
    pub fn new(registry: Arc<OutboundRegistry>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            registry,
            events,
            snapshot: RwLock::new(Arc::new(CapabilitySnapshot::default())),
        })
    }

    /// The latest published snapshot. Cheap; safe from sync contexts.
    pub fn current(&self) -> Arc<CapabilitySnapshot> {
        self.snapshot.read().expect("snapshot lock").clone()
    }

    /// Query every Ready outbound in parallel and swap in a fresh snapshot.
    /// A server that fails or times out contributes empty lists; the
    /// rebuild itself never fails.
    pub async fn update(&self) -> Arc<CapabilitySnapshot> {
        let connections = self.registry.snapshot();
        let tasks = connections.values().filter(|c| c.is_ready()).map(|conn| {
            let name = conn.name().to_string();
            let peer = conn.peer();
            let caps = conn.capabilities();
            async move {
                let Some(peer) = peer else {
                    return (name, ServerCapabilityListing::default());
                };
                let mut listing = ServerCapabilityListing::default();
                let advertises = |f: fn(&rmcp::model::ServerCapabilities) -> bool| {
                    caps.as_ref().map(f).unwrap_or(true)
                };
                if advertises(|c| c.tools.is_some()) {
                    match tokio::time::timeout(PER_SERVER_TIMEOUT, peer.list_all_tools()).await {
                        Ok(Ok(tools)) => listing.tools = tools,
                        Ok(Err(e)) => {
                            tracing::debug!(target = "aggregator", server = %name, "list tools failed: {e}");
                        }
                        Err(_) => {
                            tracing::debug!(target = "aggregator", server = %name, "list tools timed out");
                        }
                    }
                }
                if advertises(|c| c.resources.is_some()) {
                    match tokio::time::timeout(PER_SERVER_TIMEOUT, peer.list_all_resources()).await {
                        Ok(Ok(resources)) => listing.resources = resources,
                        Ok(Err(e)) => {
                            tracing::debug!(target = "aggregator", server = %name, "list resources failed: {e}");
                        }
                        Err(_) => {
                            tracing::debug!(target = "aggregator", server = %name, "list resources timed out");
                        }
                    }
                }
                if advertises(|c| c.prompts.is_some()) {
                    match tokio::time::timeout(PER_SERVER_TIMEOUT, peer.list_all_prompts()).await {
                        Ok(Ok(prompts)) => listing.prompts = prompts,
                        Ok(Err(e)) => {
                            tracing::debug!(target = "aggregator", server = %name, "list prompts failed: {e}");
                        }
                        Err(_) => {
                            tracing::debug!(target = "aggregator", server = %name, "list prompts timed out");
                        }
                    }
                }
                (name, listing)
            }
        });

        let listings: BTreeMap<String, ServerCapabilityListing> =
            join_all(tasks.collect::<Vec<_>>()).await.into_iter().collect();
        let next = Arc::new(assemble_snapshot(listings));

        let prev = {
            let mut guard = self.snapshot.write().expect("snapshot lock");
            std::mem::replace(&mut *guard, next.clone())
        };
        let changes = diff(&prev, &next);
        if !changes.is_empty() {
            tracing::debug!(
                target = "aggregator",
                tools = next.tools.len(),
                resources = next.resources.len(),
                prompts = next.prompts.len(),
                servers = next.ready_server_names.len(),
                "capabilities changed"
            );
            self.events.publish(ProxyEvent::CapabilitiesChanged(changes));
        }
        next
    }
}
