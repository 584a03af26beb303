use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use rmcp::model::ServerNotification;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregator::CapabilityChanges;
use crate::events::ProxyEvent;
use crate::outbound::{ConnectionState, OutboundNotification};
use crate::preset;
use crate::runtime::ProxyRuntime;
use crate::session::InboundSession;

/// listChanged notifications within this window collapse into one per
/// session per category.
pub const BATCH_DELAY: Duration = Duration::from_millis(100);

const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Cheap handle for poking the fabric from elsewhere (preset subscriptions,
/// config reload).
#[derive(Clone)]
pub struct NotifyHandle {
    tx: mpsc::Sender<FabricCommand>,
}

impl NotifyHandle {
    /// Schedule a full listChanged sweep for one session.
    pub fn nudge_session(&self, id: Uuid) {
        if self.tx.try_send(FabricCommand::NudgeSession(id)).is_err() {
            tracing::debug!(target = "notify", session = %id, "command queue full, nudge dropped");
        }
    }

    /// Ask for a capability snapshot rebuild.
    pub fn refresh_capabilities(&self) {
        let _ = self.tx.try_send(FabricCommand::RefreshCapabilities);
    }
}

enum FabricCommand {
    NudgeSession(Uuid),
    RefreshCapabilities,
}

#[derive(Debug, Default, Clone, Copy)]
struct PendingCategories {
    tools: bool,
    resources: bool,
    prompts: bool,
}

impl PendingCategories {
    fn all() -> Self {
        Self {
            tools: true,
            resources: true,
            prompts: true,
        }
    }

    fn merge(&mut self, other: PendingCategories) {
        self.tools |= other.tools;
        self.resources |= other.resources;
        self.prompts |= other.prompts;
    }
}

/// Routes outbound events to inbound sessions: capability diffs become
/// batched listChanged notifications, progress and log messages follow the
/// requests that caused them.
pub struct NotificationFabric {
    runtime: Arc<ProxyRuntime>,
    pending: HashMap<Uuid, PendingCategories>,
}

pub fn spawn(
    runtime: Arc<ProxyRuntime>,
    mut notifications: mpsc::Receiver<OutboundNotification>,
    shutdown: CancellationToken,
) -> NotifyHandle {
    let (tx, mut commands) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let handle = NotifyHandle { tx };
    let mut fabric = NotificationFabric {
        runtime: runtime.clone(),
        pending: HashMap::new(),
    };
    tokio::spawn(async move {
        let mut events = runtime.events.subscribe();
        loop {
            let has_pending = !fabric.pending.is_empty();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => fabric.handle_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(target = "notify", skipped = n, "event stream lagged");
                        fabric.refresh_capabilities().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                Some(notification) = notifications.recv() => {
                    fabric.handle_outbound_notification(notification).await;
                }
                Some(command) = commands.recv() => fabric.handle_command(command).await,
                _ = tokio::time::sleep(BATCH_DELAY), if has_pending => fabric.flush().await,
            }
        }
    });
    handle
}

impl NotificationFabric {
    async fn handle_event(&mut self, event: ProxyEvent) {
        match event {
            ProxyEvent::StatusChanged { state, .. } => {
                // Entering or leaving Ready moves the union capability set.
                if matches!(
                    state,
                    ConnectionState::Ready
                        | ConnectionState::Disconnected
                        | ConnectionState::Failed
                ) {
                    self.refresh_capabilities().await;
                }
            }
            ProxyEvent::CapabilitiesChanged(changes) => {
                self.apply_capability_changes(&changes);
                self.refresh_preset_memberships();
            }
            ProxyEvent::PresetSaved { name } | ProxyEvent::PresetDeleted { name } => {
                for session in self.runtime.sessions.list() {
                    if session.filter.preset_name() == Some(name.as_str())
                        && session.update_allowed(&self.runtime.registry)
                    {
                        self.enqueue(session.id, PendingCategories::all());
                    }
                }
            }
            ProxyEvent::ConfigReloaded => {
                // Descriptor changes can move any session's allowed set.
                for session in self.runtime.sessions.list() {
                    if session.update_allowed(&self.runtime.registry) {
                        self.enqueue(session.id, PendingCategories::all());
                    }
                }
                self.refresh_capabilities().await;
            }
            ProxyEvent::ServerReady { .. }
            | ProxyEvent::LoadingProgress(_)
            | ProxyEvent::LoadingComplete(_) => {}
        }
    }

    async fn handle_command(&mut self, command: FabricCommand) {
        match command {
            FabricCommand::NudgeSession(id) => {
                if let Some(session) = self
                    .runtime
                    .sessions
                    .list()
                    .into_iter()
                    .find(|s| s.id == id)
                {
                    session.update_allowed(&self.runtime.registry);
                    self.enqueue(id, PendingCategories::all());
                }
            }
            FabricCommand::RefreshCapabilities => self.refresh_capabilities().await,
        }
    }

    async fn refresh_capabilities(&mut self) {
        // Diffs publish CapabilitiesChanged back onto the bus.
        self.runtime.aggregator.update().await;
    }

    fn apply_capability_changes(&mut self, changes: &CapabilityChanges) {
        let touched: BTreeSet<&String> = changes
            .added_servers
            .iter()
            .chain(changes.removed_servers.iter())
            .collect();
        let categories = PendingCategories {
            tools: changes.tools_changed,
            resources: changes.resources_changed,
            prompts: changes.prompts_changed,
        };
        for session in self.runtime.sessions.list() {
            let allowed_moved = session.update_allowed(&self.runtime.registry);
            let visible = if touched.is_empty() {
                // A server changed its lists in place; anyone with a
                // non-empty view may be affected.
                !session.allowed().is_empty()
            } else {
                let allowed = session.allowed();
                touched.iter().any(|name| allowed.contains(*name))
            };
            if allowed_moved {
                self.enqueue(session.id, PendingCategories::all());
            } else if visible {
                self.enqueue(session.id, categories);
            }
        }
    }

    /// Recompute membership for every preset bound to a live session so
    /// its subscribers observe joins and leaves.
    fn refresh_preset_memberships(&mut self) {
        let Some(manager) = preset::global() else {
            return;
        };
        let names: BTreeSet<String> = self
            .runtime
            .sessions
            .list()
            .iter()
            .filter_map(|s| s.filter.preset_name().map(|n| n.to_string()))
            .collect();
        if names.is_empty() {
            return;
        }
        let servers: Vec<(String, BTreeSet<String>)> = self
            .runtime
            .registry
            .snapshot()
            .values()
            .filter(|c| c.is_ready())
            .map(|c| (c.name().to_string(), c.tags()))
            .collect();
        for name in names {
            if let Err(e) = manager.refresh_membership(&name, &servers) {
                tracing::debug!(target = "notify", preset = %name, "membership refresh failed: {e}");
            }
        }
    }

    async fn handle_outbound_notification(&mut self, incoming: OutboundNotification) {
        match incoming.notification {
            ServerNotification::ToolListChangedNotification(_)
            | ServerNotification::ResourceListChangedNotification(_)
            | ServerNotification::PromptListChangedNotification(_) => {
                tracing::debug!(
                    target = "notify",
                    server = %incoming.server,
                    "outbound lists changed"
                );
                self.refresh_capabilities().await;
            }
            ServerNotification::ProgressNotification(_)
            | ServerNotification::LoggingMessageNotification(_) => {
                // Correlated with in-flight requests: only sessions that
                // currently await this outbound hear it.
                let notification = incoming.notification;
                for session in self.runtime.sessions.list() {
                    if session.has_in_flight(&incoming.server) {
                        forward_to_session(&session, notification.clone()).await;
                    }
                }
            }
            ServerNotification::ResourceUpdatedNotification(_) => {
                let notification = incoming.notification;
                for session in self.runtime.sessions.list() {
                    if session.is_allowed(&incoming.server) {
                        forward_to_session(&session, notification.clone()).await;
                    }
                }
            }
            ServerNotification::CancelledNotification(_) => {}
        }
    }

    fn enqueue(&mut self, session: Uuid, categories: PendingCategories) {
        self.pending.entry(session).or_default().merge(categories);
    }

    async fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        let sessions = self.runtime.sessions.list();
        for (id, categories) in pending {
            let Some(session) = sessions.iter().find(|s| s.id == id) else {
                continue;
            };
            let Some(peer) = session.peer() else {
                continue;
            };
            if categories.tools {
                if let Err(e) = peer.notify_tool_list_changed().await {
                    tracing::debug!(target = "notify", session = %id, "tools listChanged failed: {e}");
                }
            }
            if categories.resources {
                if let Err(e) = peer.notify_resource_list_changed().await {
                    tracing::debug!(target = "notify", session = %id, "resources listChanged failed: {e}");
                }
            }
            if categories.prompts {
                if let Err(e) = peer.notify_prompt_list_changed().await {
                    tracing::debug!(target = "notify", session = %id, "prompts listChanged failed: {e}");
                }
            }
        }
    }
}

async fn forward_to_session(session: &Arc<InboundSession>, notification: ServerNotification) {
    let Some(peer) = session.peer() else {
        return;
    };
    if let Err(e) = peer.send_notification(notification).await {
        tracing::debug!(target = "notify", session = %session.id, "forward failed: {e}");
    }
}
