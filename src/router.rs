use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rmcp::{
    RoleServer,
    model as mcp,
    service::{NotificationContext, RequestContext, Service, ServiceError},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregator::CapabilitySnapshot;
use crate::error::ProxyError;
use crate::instructions::{self, InstructionContext};
use crate::notify::NotifyHandle;
use crate::preset;
use crate::runtime::ProxyRuntime;
use crate::session::{FilterSpec, InboundSession};

pub const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Debug, Serialize, Deserialize)]
struct PageCursor {
    server_index: usize,
    item_index: usize,
}

fn encode_cursor(cursor: &PageCursor) -> String {
    BASE64.encode(serde_json::to_vec(cursor).expect("cursor serializes"))
}

fn decode_cursor(text: &str) -> Result<PageCursor, ProxyError> {
    let bytes = BASE64
        .decode(text)
        .map_err(|_| ProxyError::Validation("malformed cursor".into()))?;
    serde_json::from_slice(&bytes).map_err(|_| ProxyError::Validation("malformed cursor".into()))
}

/// Walk grouped items from a cursor position, filling one page. Groups are
/// (server, items) pairs in snapshot server order.
fn paginate<T: Clone>(
    groups: &[(String, Vec<T>)],
    cursor: Option<&str>,
    page_size: usize,
) -> Result<(Vec<T>, Option<String>), ProxyError> {
    let mut pos = match cursor {
        Some(text) => decode_cursor(text)?,
        None => PageCursor {
            server_index: 0,
            item_index: 0,
        },
    };
    if pos.server_index > groups.len() {
        return Err(ProxyError::Validation("cursor out of range".into()));
    }
    let mut page = Vec::new();
    while page.len() < page_size && pos.server_index < groups.len() {
        let items = &groups[pos.server_index].1;
        if pos.item_index >= items.len() {
            pos.server_index += 1;
            pos.item_index = 0;
            continue;
        }
        page.push(items[pos.item_index].clone());
        pos.item_index += 1;
    }
    while pos.server_index < groups.len() && pos.item_index >= groups[pos.server_index].1.len() {
        pos.server_index += 1;
        pos.item_index = 0;
    }
    let next = (pos.server_index < groups.len()).then(|| encode_cursor(&pos));
    Ok((page, next))
}

fn map_service_error(err: ServiceError) -> mcp::ErrorData {
    match err {
        ServiceError::McpError(e) => e,
        other => mcp::ErrorData::internal_error(other.to_string(), None),
    }
}

/// Removes the session from the registry when the last service handle for
/// it goes away.
struct SessionCleanup {
    runtime: Arc<ProxyRuntime>,
    id: Uuid,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        self.runtime.sessions.remove(self.id);
        tracing::debug!(target = "session", session = %self.id, "closed");
    }
}

/// The virtual MCP server presented to one inbound session. Every request
/// is answered from the capability snapshot or forwarded to the outbound
/// server that owns the addressed item.
#[derive(Clone)]
pub struct ProxyService {
    runtime: Arc<ProxyRuntime>,
    session: Arc<InboundSession>,
    _cleanup: Arc<SessionCleanup>,
}

impl ProxyService {
    pub fn new(
        runtime: Arc<ProxyRuntime>,
        notify: NotifyHandle,
        filter: FilterSpec,
        enable_pagination: bool,
        custom_instructions: Option<String>,
    ) -> Self {
        let session = InboundSession::new(filter, enable_pagination, custom_instructions);
        session.update_allowed(&runtime.registry);
        runtime.sessions.insert(session.clone());
        tracing::info!(
            target = "session",
            session = %session.id,
            filter = %session.filter.cache_key(),
            "connected"
        );
        if let Some(name) = session.filter.preset_name() {
            if let Some(manager) = preset::global() {
                manager.mark_used(name);
                let session_id = session.id;
                let notify = notify.clone();
                let id = manager.subscribe(name, move |_| notify.nudge_session(session_id));
                session.set_preset_subscription(id);
            } else {
                tracing::warn!(target = "session", preset = %name, "preset manager not initialized");
            }
        }
        let cleanup = Arc::new(SessionCleanup {
            runtime: runtime.clone(),
            id: session.id,
        });
        Self {
            runtime,
            session,
            _cleanup: cleanup,
        }
    }

    pub fn session(&self) -> Arc<InboundSession> {
        self.session.clone()
    }

    fn server_info_struct(&self) -> mcp::Implementation {
        mcp::Implementation {
            name: "1mcp".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            title: None,
            website_url: None,
            icons: None,
        }
    }

    fn capabilities(&self) -> mcp::ServerCapabilities {
        mcp::ServerCapabilities::builder()
            .enable_logging()
            .enable_tools()
            .enable_tool_list_changed()
            .enable_resources()
            .enable_resources_subscribe()
            .enable_resources_list_changed()
            .enable_prompts()
            .enable_prompts_list_changed()
            .build()
    }

    fn compose_instructions(&self) -> String {
        let snapshot = self.runtime.aggregator.current();
        let allowed = self.session.allowed();
        let names: Vec<String> = snapshot
            .ready_server_names
            .iter()
            .filter(|n| allowed.contains(*n))
            .cloned()
            .collect();
        let mut per_server = BTreeMap::new();
        for name in &names {
            if let Some(conn) = self.runtime.registry.get(name) {
                if let Some(text) = conn.instructions() {
                    per_server.insert(name.clone(), text);
                }
            }
        }
        let ctx = InstructionContext {
            server_names: names,
            filter_context: self.session.filter.context_label(),
            per_server,
        };
        instructions::render(self.session.custom_instructions.as_deref(), &ctx)
    }

    /// The snapshot in effect for the whole of one request.
    fn snapshot(&self) -> Arc<CapabilitySnapshot> {
        self.runtime.aggregator.current()
    }

    fn cursor_of(params: Option<mcp::PaginatedRequestParam>) -> Option<String> {
        params.and_then(|p| p.cursor)
    }

    fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<mcp::ListToolsResult, ProxyError> {
        let snapshot = self.snapshot();
        let allowed = self.session.allowed();
        let groups: Vec<(String, Vec<mcp::Tool>)> = snapshot
            .ready_server_names
            .iter()
            .filter(|name| allowed.contains(*name))
            .map(|name| {
                let tools: Vec<mcp::Tool> = snapshot
                    .tools
                    .iter()
                    .filter(|t| &t.server == name)
                    .map(|t| t.tool.clone())
                    .collect();
                (name.clone(), tools)
            })
            .collect();
        if self.session.enable_pagination {
            let (tools, next_cursor) =
                paginate(&groups, cursor.as_deref(), DEFAULT_PAGE_SIZE)?;
            Ok(mcp::ListToolsResult { tools, next_cursor })
        } else {
            Ok(mcp::ListToolsResult {
                tools: groups.into_iter().flat_map(|(_, items)| items).collect(),
                next_cursor: None,
            })
        }
    }

    fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<mcp::ListResourcesResult, ProxyError> {
        let snapshot = self.snapshot();
        let allowed = self.session.allowed();
        let groups: Vec<(String, Vec<mcp::Resource>)> = snapshot
            .ready_server_names
            .iter()
            .filter(|name| allowed.contains(*name))
            .map(|name| {
                let resources: Vec<mcp::Resource> = snapshot
                    .resources
                    .iter()
                    .filter(|r| &r.server == name)
                    .map(|r| r.resource.clone())
                    .collect();
                (name.clone(), resources)
            })
            .collect();
        if self.session.enable_pagination {
            let (resources, next_cursor) =
                paginate(&groups, cursor.as_deref(), DEFAULT_PAGE_SIZE)?;
            Ok(mcp::ListResourcesResult {
                resources,
                next_cursor,
            })
        } else {
            Ok(mcp::ListResourcesResult {
                resources: groups.into_iter().flat_map(|(_, items)| items).collect(),
                next_cursor: None,
            })
        }
    }

    fn list_prompts(
        &self,
        cursor: Option<String>,
    ) -> Result<mcp::ListPromptsResult, ProxyError> {
        let snapshot = self.snapshot();
        let allowed = self.session.allowed();
        let groups: Vec<(String, Vec<mcp::Prompt>)> = snapshot
            .ready_server_names
            .iter()
            .filter(|name| allowed.contains(*name))
            .map(|name| {
                let prompts: Vec<mcp::Prompt> = snapshot
                    .prompts
                    .iter()
                    .filter(|p| &p.server == name)
                    .map(|p| p.prompt.clone())
                    .collect();
                (name.clone(), prompts)
            })
            .collect();
        if self.session.enable_pagination {
            let (prompts, next_cursor) =
                paginate(&groups, cursor.as_deref(), DEFAULT_PAGE_SIZE)?;
            Ok(mcp::ListPromptsResult {
                prompts,
                next_cursor,
            })
        } else {
            Ok(mcp::ListPromptsResult {
                prompts: groups.into_iter().flat_map(|(_, items)| items).collect(),
                next_cursor: None,
            })
        }
    }

    /// Admission checks shared by every routed call: the owner must be in
    /// the session's allowed set and Ready right now.
    fn admit(&self, owner: &str) -> Result<(crate::outbound::OutboundClientHandle, u64), ProxyError> {
        if !self.session.is_allowed(owner) {
            return Err(ProxyError::NotAllowed(owner.to_string()));
        }
        let conn = self
            .runtime
            .registry
            .get(owner)
            .ok_or_else(|| ProxyError::ServerUnavailable(owner.to_string()))?;
        if !conn.is_ready() {
            return Err(ProxyError::ServerUnavailable(owner.to_string()));
        }
        let peer = conn
            .peer()
            .ok_or_else(|| ProxyError::ServerUnavailable(owner.to_string()))?;
        Ok((peer, conn.call_timeout_ms()))
    }

    /// Forward one request to `owner`, serialized per (session, outbound),
    /// bounded by the descriptor call timeout.
    async fn forward<T, F, Fut>(&self, owner: &str, call: F) -> Result<T, mcp::ErrorData>
    where
        F: FnOnce(crate::outbound::OutboundClientHandle) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let (peer, timeout_ms) = self.admit(owner).map_err(mcp::ErrorData::from)?;
        let lock = self.session.outbound_lock(owner);
        let _serialized = lock.lock().await;
        let _in_flight = self.session.track_in_flight(owner);
        match tokio::time::timeout(Duration::from_millis(timeout_ms), call(peer)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(map_service_error(e)),
            Err(_) => Err(ProxyError::CallTimeout(owner.to_string(), timeout_ms).into()),
        }
    }

    /// Fan a request out to every allowed Ready outbound; first success
    /// wins, failures are logged.
    async fn forward_first_success(
        &self,
        request: mcp::ClientRequest,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let snapshot = self.snapshot();
        let allowed = self.session.allowed();
        let mut last_err: Option<mcp::ErrorData> = None;
        for name in snapshot.ready_server_names.iter().filter(|n| allowed.contains(*n)) {
            match self
                .forward(name, |peer| {
                    let request = request.clone();
                    async move { peer.send_request(request).await }
                })
                .await
            {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::debug!(target = "router", server = %name, "fan-out failed: {}", e.message);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| ProxyError::ServerUnavailable("any".into()).into()))
    }

    /// Deliver a request to every allowed Ready outbound. Succeeds when at
    /// least one target acknowledged; failures are logged per server.
    async fn forward_all(
        &self,
        request: mcp::ClientRequest,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        let snapshot = self.snapshot();
        let allowed = self.session.allowed();
        let mut first_ok: Option<mcp::ServerResult> = None;
        let mut last_err: Option<mcp::ErrorData> = None;
        for name in snapshot.ready_server_names.iter().filter(|n| allowed.contains(*n)) {
            match self
                .forward(name, |peer| {
                    let request = request.clone();
                    async move { peer.send_request(request).await }
                })
                .await
            {
                Ok(result) => {
                    if first_ok.is_none() {
                        first_ok = Some(result);
                    }
                }
                Err(e) => {
                    tracing::debug!(target = "router", server = %name, "fan-out failed: {}", e.message);
                    last_err = Some(e);
                }
            }
        }
        match (first_ok, last_err) {
            (Some(result), _) => Ok(result),
            (None, Some(err)) => Err(err),
            (None, None) => Ok(mcp::ServerResult::empty(())),
        }
    }
}

impl Service<RoleServer> for ProxyService {
    fn handle_request(
        &self,
        request: mcp::ClientRequest,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<mcp::ServerResult, mcp::ErrorData>> + Send {
        let service = self.clone();
        async move {
            match request {
                mcp::ClientRequest::InitializeRequest(_req) => {
                    service.session.set_peer(context.peer.clone());
                    service.session.update_allowed(&service.runtime.registry);
                    let result = mcp::InitializeResult {
                        protocol_version: mcp::ProtocolVersion::V_2025_03_26,
                        capabilities: service.capabilities(),
                        server_info: service.server_info_struct(),
                        instructions: Some(service.compose_instructions()),
                    };
                    Ok(mcp::ServerResult::InitializeResult(result))
                }
                mcp::ClientRequest::PingRequest(_) => Ok(mcp::ServerResult::empty(())),
                mcp::ClientRequest::ListToolsRequest(req) => {
                    let cursor = Self::cursor_of(req.params);
                    service
                        .list_tools(cursor)
                        .map(mcp::ServerResult::ListToolsResult)
                        .map_err(mcp::ErrorData::from)
                }
                mcp::ClientRequest::ListResourcesRequest(req) => {
                    let cursor = Self::cursor_of(req.params);
                    service
                        .list_resources(cursor)
                        .map(mcp::ServerResult::ListResourcesResult)
                        .map_err(mcp::ErrorData::from)
                }
                mcp::ClientRequest::ListPromptsRequest(req) => {
                    let cursor = Self::cursor_of(req.params);
                    service
                        .list_prompts(cursor)
                        .map(mcp::ServerResult::ListPromptsResult)
                        .map_err(mcp::ErrorData::from)
                }
                mcp::ClientRequest::ListResourceTemplatesRequest(_) => Ok(
                    mcp::ServerResult::ListResourceTemplatesResult(
                        mcp::ListResourceTemplatesResult {
                            resource_templates: vec![],
                            next_cursor: None,
                        },
                    ),
                ),
                mcp::ClientRequest::CallToolRequest(req) => {
                    let name = req.params.name.to_string();
                    let snapshot = service.snapshot();
                    let owner = snapshot
                        .tool_owner(&name)
                        .map(|t| t.server.clone())
                        .ok_or_else(|| {
                            mcp::ErrorData::from(ProxyError::NotFound("tool", name.clone()))
                        })?;
                    let params = req.params.clone();
                    service
                        .forward(&owner, |peer| async move { peer.call_tool(params).await })
                        .await
                        .map(mcp::ServerResult::CallToolResult)
                }
                mcp::ClientRequest::ReadResourceRequest(req) => {
                    let uri = req.params.uri.clone();
                    let snapshot = service.snapshot();
                    let owner = snapshot
                        .resource_owner(&uri)
                        .map(|r| r.server.clone())
                        .ok_or_else(|| {
                            mcp::ErrorData::from(ProxyError::NotFound("resource", uri.clone()))
                        })?;
                    let params = req.params.clone();
                    service
                        .forward(&owner, |peer| async move { peer.read_resource(params).await })
                        .await
                        .map(mcp::ServerResult::ReadResourceResult)
                }
                mcp::ClientRequest::GetPromptRequest(req) => {
                    let name = req.params.name.clone();
                    let snapshot = service.snapshot();
                    let owner = snapshot
                        .prompt_owner(&name)
                        .map(|p| p.server.clone())
                        .ok_or_else(|| {
                            mcp::ErrorData::from(ProxyError::NotFound("prompt", name.clone()))
                        })?;
                    let params = req.params.clone();
                    service
                        .forward(&owner, |peer| async move { peer.get_prompt(params).await })
                        .await
                        .map(mcp::ServerResult::GetPromptResult)
                }
                mcp::ClientRequest::SubscribeRequest(req) => {
                    let uri = req.params.uri.clone();
                    let snapshot = service.snapshot();
                    let owner = snapshot
                        .resource_owner(&uri)
                        .map(|r| r.server.clone())
                        .ok_or_else(|| {
                            mcp::ErrorData::from(ProxyError::NotFound("resource", uri.clone()))
                        })?;
                    service
                        .forward_request_to(&owner, mcp::ClientRequest::SubscribeRequest(req))
                        .await
                }
                mcp::ClientRequest::UnsubscribeRequest(req) => {
                    let uri = req.params.uri.clone();
                    let snapshot = service.snapshot();
                    let owner = snapshot
                        .resource_owner(&uri)
                        .map(|r| r.server.clone())
                        .ok_or_else(|| {
                            mcp::ErrorData::from(ProxyError::NotFound("resource", uri.clone()))
                        })?;
                    service
                        .forward_request_to(&owner, mcp::ClientRequest::UnsubscribeRequest(req))
                        .await
                }
                mcp::ClientRequest::CompleteRequest(req) => {
                    service
                        .forward_first_success(mcp::ClientRequest::CompleteRequest(req))
                        .await
                }
                mcp::ClientRequest::SetLevelRequest(req) => {
                    // Level changes apply to every allowed outbound; one
                    // acknowledgement is enough to answer the client.
                    service
                        .forward_all(mcp::ClientRequest::SetLevelRequest(req))
                        .await
                }
            }
        }
    }

    fn handle_notification(
        &self,
        notification: mcp::ClientNotification,
        _context: NotificationContext<RoleServer>,
    ) -> impl Future<Output = Result<(), mcp::ErrorData>> + Send {
        let service = self.clone();
        async move {
            match notification {
                mcp::ClientNotification::RootsListChangedNotification(n) => {
                    // Roots fan out to every allowed Ready outbound.
                    let snapshot = service.snapshot();
                    let allowed = service.session.allowed();
                    for name in snapshot
                        .ready_server_names
                        .iter()
                        .filter(|n| allowed.contains(*n))
                    {
                        if let Some(peer) =
                            service.runtime.registry.get(name).and_then(|c| c.peer())
                        {
                            let n = n.clone();
                            if let Err(e) = peer
                                .send_notification(
                                    mcp::ClientNotification::RootsListChangedNotification(n),
                                )
                                .await
                            {
                                tracing::debug!(
                                    target = "router",
                                    server = %name,
                                    "roots notification failed: {e}"
                                );
                            }
                        }
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        }
    }

    fn get_info(&self) -> mcp::ServerInfo {
        mcp::ServerInfo {
            protocol_version: mcp::ProtocolVersion::V_2025_03_26,
            capabilities: self.capabilities(),
            server_info: self.server_info_struct(),
            instructions: Some(self.compose_instructions()),
        }
    }
}

impl ProxyService {
    async fn forward_request_to(
        &self,
        owner: &str,
        request: mcp::ClientRequest,
    ) -> Result<mcp::ServerResult, mcp::ErrorData> {
        self.forward(owner, |peer| async move { peer.send_request(request).await })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(spec: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        spec.iter()
            .map(|(name, items)| {
                (
                    name.to_string(),
                    items.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn pagination_walks_groups_in_order() {
        let groups = groups(&[("a", &["t1", "t2"]), ("b", &[]), ("c", &["t3"])]);
        let (page, next) = paginate(&groups, None, 2).unwrap();
        assert_eq!(page, vec!["t1", "t2"]);
        let cursor = next.expect("more pages");

        let (page, next) = paginate(&groups, Some(&cursor), 2).unwrap();
        assert_eq!(page, vec!["t3"]);
        assert!(next.is_none());
    }

    #[test]
    fn pagination_without_cursor_returns_all_when_page_fits() {
        let groups = groups(&[("a", &["t1"]), ("b", &["t2"])]);
        let (page, next) = paginate(&groups, None, 100).unwrap();
        assert_eq!(page.len(), 2);
        assert!(next.is_none());
    }

    #[test]
    fn malformed_cursors_are_rejected() {
        let groups = groups(&[("a", &["t1"])]);
        assert!(paginate(&groups, Some("not-base64!"), 10).is_err());
        let far = encode_cursor(&PageCursor {
            server_index: 9,
            item_index: 0,
        });
        assert!(paginate(&groups, Some(&far), 10).is_err());
    }

    #[test]
    fn cursor_round_trip() {
        let cursor = PageCursor {
            server_index: 3,
            item_index: 41,
        };
        let decoded = decode_cursor(&encode_cursor(&cursor)).unwrap();
        assert_eq!(decoded.server_index, 3);
        assert_eq!(decoded.item_index, 41);
    }
}
