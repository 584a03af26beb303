use std::{
    collections::{BTreeSet, HashMap},
    sync::{Arc, Mutex, RwLock},
};

use rmcp::service::{Peer, RoleServer};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::outbound::OutboundRegistry;
use crate::preset;
use crate::tag_query::{self, TagQuery};

/// How a session selects the outbound servers it may see.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    None,
    SimpleTags(BTreeSet<String>),
    Expr(TagQuery),
    Preset(String),
}

impl FilterSpec {
    /// Resolve the inbound query parameters. Precedence when several are
    /// given: `preset` over `tag-filter` over the deprecated `tags`.
    pub fn from_query_params(
        preset: Option<&str>,
        tag_filter: Option<&str>,
        tags: Option<&str>,
    ) -> Result<Self, ProxyError> {
        if let Some(name) = preset.filter(|s| !s.is_empty()) {
            return Ok(FilterSpec::Preset(name.to_string()));
        }
        if let Some(expr) = tag_filter.filter(|s| !s.is_empty()) {
            return Ok(FilterSpec::Expr(tag_query::parse(expr)?));
        }
        if let Some(csv) = tags.filter(|s| !s.is_empty()) {
            return Ok(FilterSpec::SimpleTags(tag_query::parse_simple_tags(csv)?));
        }
        Ok(FilterSpec::None)
    }

    /// Does an outbound server with `tags` pass this filter? A preset that
    /// no longer exists admits nothing.
    pub fn matches(&self, tags: &BTreeSet<String>) -> bool {
        match self {
            FilterSpec::None => true,
            FilterSpec::SimpleTags(wanted) => wanted.iter().any(|t| tags.contains(t)),
            FilterSpec::Expr(query) => query.matches(tags),
            FilterSpec::Preset(name) => preset::global()
                .and_then(|m| m.get(name))
                .map(|p| p.matches(tags))
                .unwrap_or(false),
        }
    }

    pub fn preset_name(&self) -> Option<&str> {
        match self {
            FilterSpec::Preset(name) => Some(name),
            _ => None,
        }
    }

    /// Human-readable form for the instructions template.
    pub fn context_label(&self) -> Option<String> {
        match self {
            FilterSpec::None => None,
            FilterSpec::SimpleTags(tags) => {
                Some(tags.iter().cloned().collect::<Vec<_>>().join(", "))
            }
            FilterSpec::Expr(query) => Some(query.to_string()),
            FilterSpec::Preset(name) => Some(format!("preset '{name}'")),
        }
    }

    /// Stable key for grouping inbound sessions that share a filter.
    pub fn cache_key(&self) -> String {
        match self {
            FilterSpec::None => "none".to_string(),
            FilterSpec::SimpleTags(tags) => {
                format!("tags:{}", tags.iter().cloned().collect::<Vec<_>>().join(","))
            }
            FilterSpec::Expr(query) => format!("expr:{query}"),
            FilterSpec::Preset(name) => format!("preset:{name}"),
        }
    }
}

/// Decrements the session's in-flight counter for one outbound on drop.
pub struct InFlightGuard {
    session: Arc<InboundSession>,
    outbound: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.session.in_flight.lock().expect("in_flight lock");
        if let Some(count) = in_flight.get_mut(&self.outbound) {
            *count -= 1;
            if *count == 0 {
                in_flight.remove(&self.outbound);
            }
        }
    }
}

/// One inbound MCP session: its filter, the set of outbound servers it may
/// see, and the peer handle used to push notifications back to the client.
pub struct InboundSession {
    pub id: Uuid,
    pub filter: FilterSpec,
    pub enable_pagination: bool,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub custom_instructions: Option<String>,
    peer: RwLock<Option<Peer<RoleServer>>>,
    allowed: RwLock<BTreeSet<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    outbound_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    preset_subscription: Mutex<Option<preset::SubscriptionId>>,
}

impl InboundSession {
    pub fn new(
        filter: FilterSpec,
        enable_pagination: bool,
        custom_instructions: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            filter,
            enable_pagination,
            connected_at: chrono::Utc::now(),
            custom_instructions,
            peer: RwLock::new(None),
            allowed: RwLock::new(BTreeSet::new()),
            in_flight: Mutex::new(HashMap::new()),
            outbound_locks: Mutex::new(HashMap::new()),
            preset_subscription: Mutex::new(None),
        })
    }

    pub fn set_peer(&self, peer: Peer<RoleServer>) {
        *self.peer.write().expect("peer lock") = Some(peer);
    }

    pub fn peer(&self) -> Option<Peer<RoleServer>> {
        self.peer.read().expect("peer lock").clone()
    }

    pub fn allowed(&self) -> BTreeSet<String> {
        self.allowed.read().expect("allowed lock").clone()
    }

    pub fn is_allowed(&self, outbound: &str) -> bool {
        self.allowed.read().expect("allowed lock").contains(outbound)
    }

    /// Recompute `allowed` from the registry. Returns true when the set
    /// moved, which is the signal to tell the client its lists changed.
    pub fn update_allowed(&self, registry: &OutboundRegistry) -> bool {
        let next: BTreeSet<String> = registry
            .snapshot()
            .values()
            .filter(|conn| self.filter.matches(&conn.tags()))
            .map(|conn| conn.name().to_string())
            .collect();
        let mut allowed = self.allowed.write().expect("allowed lock");
        if *allowed == next {
            false
        } else {
            *allowed = next;
            true
        }
    }

    /// Per-(session, outbound) request serialization: requests to the same
    /// outbound preserve initiation order, distinct outbounds run in
    /// parallel.
    pub fn outbound_lock(&self, outbound: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.outbound_locks
            .lock()
            .expect("outbound_locks lock")
            .entry(outbound.to_string())
            .or_default()
            .clone()
    }

    pub fn track_in_flight(self: &Arc<Self>, outbound: &str) -> InFlightGuard {
        *self
            .in_flight
            .lock()
            .expect("in_flight lock")
            .entry(outbound.to_string())
            .or_insert(0) += 1;
        InFlightGuard {
            session: self.clone(),
            outbound: outbound.to_string(),
        }
    }

    /// Whether this session has a request outstanding against `outbound`;
    /// drives progress/log notification forwarding.
    pub fn has_in_flight(&self, outbound: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in_flight lock")
            .contains_key(outbound)
    }

    pub fn set_preset_subscription(&self, id: preset::SubscriptionId) {
        *self.preset_subscription.lock().expect("subscription lock") = Some(id);
    }

    fn take_preset_subscription(&self) -> Option<preset::SubscriptionId> {
        self.preset_subscription.lock().expect("subscription lock").take()
    }
}

/// All live inbound sessions in this process.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<InboundSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<InboundSession>) {
        self.sessions
            .write()
            .expect("session lock")
            .insert(session.id, session);
    }

    /// Drop a closed session and untrack its preset subscription.
    pub fn remove(&self, id: Uuid) {
        let removed = self.sessions.write().expect("session lock").remove(&id);
        if let Some(session) = removed {
            if let Some(sub) = session.take_preset_subscription() {
                if let Some(manager) = preset::global() {
                    manager.unsubscribe(sub);
                }
            }
        }
    }

    pub fn list(&self) -> Vec<Arc<InboundSession>> {
        self.sessions
            .read()
            .expect("session lock")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("session lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
