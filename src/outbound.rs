use std::{
    collections::{BTreeSet, HashMap},
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use rmcp::{
    model::{
        ClientCapabilities, ClientInfo, ClientResult, Implementation, ListRootsResult,
        ProtocolVersion, ServerCapabilities, ServerNotification, ServerRequest,
    },
    service::{NotificationContext, Peer, RequestContext, RoleClient, Service},
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use crate::config::{ConfigProvider, ServerDescriptor};
use crate::error::ProxyError;
use crate::events::{EventBus, ProxyEvent};
use crate::transport::{TransportSpec, restart::RestartState};

/// Cloneable request handle for one Ready outbound connection.
pub type OutboundClientHandle = Peer<RoleClient>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Disconnected,
    Failed,
    AwaitingOauth,
}

impl ConnectionState {
    pub fn is_retryable(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }
}

#[derive(Debug, Clone)]
struct StateInfo {
    state: ConnectionState,
    state_since: Instant,
    last_error: Option<String>,
    last_connected_at: Option<chrono::DateTime<chrono::Utc>>,
    retry_count: u32,
    load_time_ms: Option<u64>,
}

/// A notification that arrived from one outbound server, routed through the
/// notification fabric.
#[derive(Debug)]
pub struct OutboundNotification {
    pub server: String,
    pub notification: ServerNotification,
}

/// Live client handle for a Ready connection.
#[derive(Clone)]
pub struct OutboundClient {
    pub peer: Peer<RoleClient>,
    pub cancel: Arc<std::sync::Mutex<Option<rmcp::service::RunningServiceCancellationToken>>>,
}

/// One outbound MCP server: descriptor, dial spec, live client, and the
/// state machine everything else observes. Written only by the loading
/// manager; other components hold read-only handles.
pub struct OutboundConnection {
    spec: TransportSpec,
    events: EventBus,
    state: RwLock<StateInfo>,
    client: RwLock<Option<OutboundClient>>,
    instructions: RwLock<Option<String>>,
    capabilities: RwLock<Option<ServerCapabilities>>,
    restart: RwLock<Option<Arc<RestartState>>>,
    closing: AtomicBool,
}

impl OutboundConnection {
    pub fn new(descriptor: ServerDescriptor, events: EventBus) -> Result<Arc<Self>, ProxyError> {
        let spec = TransportSpec::new(descriptor)?;
        Ok(Arc::new(Self {
            spec,
            events,
            state: RwLock::new(StateInfo {
                state: ConnectionState::Idle,
                state_since: Instant::now(),
                last_error: None,
                last_connected_at: None,
                retry_count: 0,
                load_time_ms: None,
            }),
            client: RwLock::new(None),
            instructions: RwLock::new(None),
            capabilities: RwLock::new(None),
            restart: RwLock::new(None),
            closing: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        self.spec.name()
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.spec.descriptor
    }

    pub fn tags(&self) -> BTreeSet<String> {
        crate::tag_query::normalize_tags(&self.spec.descriptor.tags)
    }

    pub fn call_timeout_ms(&self) -> u64 {
        self.spec.call_timeout_ms()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.read().expect("state lock").state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.read().expect("state lock").last_error.clone()
    }

    pub fn retry_count(&self) -> u32 {
        self.state.read().expect("state lock").retry_count
    }

    pub fn state_duration_ms(&self) -> u64 {
        self.state.read().expect("state lock").state_since.elapsed().as_millis() as u64
    }

    pub fn load_time_ms(&self) -> Option<u64> {
        self.state.read().expect("state lock").load_time_ms
    }

    pub fn last_connected_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.state.read().expect("state lock").last_connected_at
    }

    pub fn instructions(&self) -> Option<String> {
        self.instructions.read().expect("instructions lock").clone()
    }

    pub fn capabilities(&self) -> Option<ServerCapabilities> {
        self.capabilities.read().expect("capabilities lock").clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart
            .read()
            .expect("restart lock")
            .as_ref()
            .map(|r| r.restart_count())
            .unwrap_or(0)
    }

    /// Peer handle, present only while Ready.
    pub fn peer(&self) -> Option<Peer<RoleClient>> {
        self.client
            .read()
            .expect("client lock")
            .as_ref()
            .map(|c| c.peer.clone())
    }

    fn transition(&self, next: ConnectionState, error: Option<String>) {
        {
            let mut info = self.state.write().expect("state lock");
            if info.state == next && error.is_none() {
                return;
            }
            info.state = next;
            info.state_since = Instant::now();
            if let Some(err) = error {
                info.last_error = Some(err);
            }
        }
        tracing::debug!(target = "outbound", server = %self.name(), state = ?next, "transition");
        self.events.publish(ProxyEvent::StatusChanged {
            server: self.name().to_string(),
            state: next,
        });
    }

    pub fn mark_connecting(&self) {
        self.transition(ConnectionState::Connecting, None);
    }

    pub fn mark_failed(&self, err: &ProxyError) {
        {
            let mut info = self.state.write().expect("state lock");
            info.retry_count += 1;
        }
        let next = match err {
            ProxyError::AwaitingOauth(_) => ConnectionState::AwaitingOauth,
            _ => ConnectionState::Failed,
        };
        self.transition(next, Some(err.to_string()));
    }

    /// Used by background retry to leave the observable state untouched
    /// after a failed attempt.
    pub(crate) fn restore_state(&self, state: ConnectionState, error: Option<String>) {
        self.transition(state, error);
    }

    pub fn mark_disconnected(&self, reason: Option<String>) {
        *self.client.write().expect("client lock") = None;
        self.transition(ConnectionState::Disconnected, reason);
    }

    fn mark_ready(
        &self,
        client: OutboundClient,
        instructions: Option<String>,
        capabilities: Option<ServerCapabilities>,
        restart: Option<Arc<RestartState>>,
        load_time_ms: u64,
    ) {
        *self.client.write().expect("client lock") = Some(client);
        *self.instructions.write().expect("instructions lock") = instructions;
        *self.capabilities.write().expect("capabilities lock") = capabilities;
        *self.restart.write().expect("restart lock") = restart;
        {
            let mut info = self.state.write().expect("state lock");
            info.retry_count = 0;
            info.last_error = None;
            info.last_connected_at = Some(chrono::Utc::now());
            info.load_time_ms = Some(load_time_ms);
        }
        self.transition(ConnectionState::Ready, None);
        self.events.publish(ProxyEvent::ServerReady {
            server: self.name().to_string(),
        });
    }

    /// Dial and promote to Ready. On success the connection owns the
    /// running client; a watcher task downgrades it when the transport
    /// closes underneath us.
    pub async fn connect(
        self: &Arc<Self>,
        cp: &dyn ConfigProvider,
        notifications: mpsc::Sender<OutboundNotification>,
    ) -> Result<(), ProxyError> {
        self.mark_connecting();
        let started = Instant::now();
        let sink = OutboundSink {
            server: self.name().to_string(),
            notifications,
        };
        let outcome = match self.spec.dial(cp, sink).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.mark_failed(&e);
                return Err(e);
            }
        };
        self.adopt(outcome.running, outcome.restart, started.elapsed().as_millis() as u64);
        Ok(())
    }

    /// Adopt an established client session: promote to Ready, capture the
    /// remote's instructions and capabilities, and watch for transport
    /// close. Used by `connect` and by callers that establish the session
    /// out of band (in-process servers, post-authorization redials).
    pub fn attach<S>(self: &Arc<Self>, running: rmcp::service::RunningService<RoleClient, S>)
    where
        S: Service<RoleClient> + Send + 'static,
    {
        self.adopt(running, None, 0);
    }

    fn adopt<S>(
        self: &Arc<Self>,
        running: rmcp::service::RunningService<RoleClient, S>,
        restart: Option<Arc<RestartState>>,
        load_time_ms: u64,
    ) where
        S: Service<RoleClient> + Send + 'static,
    {
        let peer = running.peer().clone();
        let cancel = Arc::new(std::sync::Mutex::new(Some(running.cancellation_token())));
        let (instructions, capabilities) = match peer.peer_info() {
            Some(info) => (info.instructions.clone(), Some(info.capabilities.clone())),
            None => (None, None),
        };

        let conn = self.clone();
        tokio::spawn(async move {
            let quit = running.waiting().await;
            if conn.closing.load(Ordering::Relaxed) {
                return;
            }
            let restart = conn.restart.read().expect("restart lock").clone();
            if let Some(state) = restart.filter(|r| r.is_exhausted()) {
                let err = ProxyError::TransportExhausted(state.restart_count());
                *conn.client.write().expect("client lock") = None;
                conn.transition(ConnectionState::Failed, Some(err.to_string()));
            } else {
                conn.mark_disconnected(Some(format!("transport closed: {quit:?}")));
            }
        });

        self.mark_ready(
            OutboundClient { peer, cancel },
            instructions,
            capabilities,
            restart,
            load_time_ms,
        );
        tracing::info!(target = "outbound", server = %self.name(), "ready");
    }

    /// Intentional close; suppresses the watcher's Disconnected transition.
    pub fn close(&self) {
        self.closing.store(true, Ordering::Relaxed);
        if let Some(client) = self.client.write().expect("client lock").take() {
            if let Some(token) = client.cancel.lock().expect("cancel lock").take() {
                token.cancel();
            }
        }
        self.transition(ConnectionState::Idle, None);
    }
}

/// Client-side service for one outbound connection: answers the few
/// requests an MCP server may send back and feeds notifications into the
/// fabric.
#[derive(Clone)]
pub struct OutboundSink {
    server: String,
    notifications: mpsc::Sender<OutboundNotification>,
}

impl OutboundSink {
    pub fn new(server: String, notifications: mpsc::Sender<OutboundNotification>) -> Self {
        Self {
            server,
            notifications,
        }
    }
}

impl Service<RoleClient> for OutboundSink {
    fn handle_request(
        &self,
        request: ServerRequest,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<ClientResult, rmcp::model::ErrorData>> + Send {
        async move {
            match request {
                ServerRequest::PingRequest(_) => Ok(ClientResult::empty(())),
                ServerRequest::ListRootsRequest(_) => {
                    Ok(ClientResult::ListRootsResult(ListRootsResult { roots: vec![] }))
                }
                _ => Err(rmcp::model::ErrorData::method_not_found::<
                    rmcp::model::PingRequestMethod,
                >()),
            }
        }
    }

    fn handle_notification(
        &self,
        notification: ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = Result<(), rmcp::model::ErrorData>> + Send {
        let server = self.server.clone();
        let tx = self.notifications.clone();
        async move {
            // try_send: a saturated fabric drops notifications rather than
            // stalling the outbound read loop.
            if let Err(e) = tx.try_send(OutboundNotification {
                server: server.clone(),
                notification,
            }) {
                tracing::debug!(target = "outbound", server = %server, "notification dropped: {e}");
            }
            Ok(())
        }
    }

    fn get_info(&self) -> ClientInfo {
        ClientInfo {
            protocol_version: ProtocolVersion::default(),
            capabilities: ClientCapabilities::default(),
            client_info: Implementation {
                name: "1mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                website_url: None,
                icons: None,
            },
        }
    }
}

/// The mutable `name -> connection` registry. Only the loading manager
/// writes; readers take an atomically swapped snapshot.
#[derive(Default)]
pub struct OutboundRegistry {
    inner: RwLock<Arc<HashMap<String, Arc<OutboundConnection>>>>,
}

impl OutboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<OutboundConnection>>> {
        self.inner.read().expect("registry lock").clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        self.snapshot().get(name).cloned()
    }

    pub fn insert(&self, conn: Arc<OutboundConnection>) {
        let mut guard = self.inner.write().expect("registry lock");
        let mut next = (**guard).clone();
        next.insert(conn.name().to_string(), conn);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, name: &str) -> Option<Arc<OutboundConnection>> {
        let mut guard = self.inner.write().expect("registry lock");
        let mut next = (**guard).clone();
        let removed = next.remove(name);
        *guard = Arc::new(next);
        removed
    }

    /// Names of Ready connections, sorted; the aggregator's iteration order.
    pub fn ready_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .snapshot()
            .values()
            .filter(|c| c.is_ready())
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }
}
