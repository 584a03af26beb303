#![allow(dead_code)]

use std::{
    fs,
    future::Future,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use rmcp::{
    model as mcp, serve_client, serve_server,
    service::{
        NotificationContext, Peer, RequestContext, RoleClient, RoleServer, RunningService, Service,
    },
    transport::StreamableHttpClientTransport,
};
use tokio_util::sync::CancellationToken;

use onemcp::config::{ConfigProvider, LoadingOptions, ServerDescriptor};
use onemcp::notify::{self, NotifyHandle};
use onemcp::outbound::{OutboundConnection, OutboundSink};
use onemcp::runtime::ProxyRuntime;
use onemcp::server::start_http_server;

#[derive(Clone)]
pub struct TestProvider {
    base: PathBuf,
}

impl TestProvider {
    pub fn new() -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let tid = format!("{:?}", std::thread::current().id());
        let dir = std::env::temp_dir().join(format!(
            "onemcp-tests-{}-{}-{}",
            std::process::id(),
            tid,
            stamp
        ));
        fs::create_dir_all(&dir).unwrap();
        Self { base: dir }
    }
}

impl Default for TestProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigProvider for TestProvider {
    fn base_dir(&self) -> PathBuf {
        self.base.clone()
    }
}

/// An in-process outbound MCP server, served over a duplex pipe.
#[derive(Clone)]
pub struct MockOutbound {
    pub name: String,
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub call_delay: Duration,
    /// (tool, started, finished) per handled call.
    pub calls: Arc<Mutex<Vec<(String, Instant, Instant)>>>,
}

impl MockOutbound {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: vec![],
            prompts: vec![],
            resources: vec![],
            call_delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_prompts(mut self, prompts: &[&str]) -> Self {
        self.prompts = prompts.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    fn initialize_result(&self) -> mcp::InitializeResult {
        mcp::InitializeResult {
            protocol_version: mcp::ProtocolVersion::V_2025_03_26,
            capabilities: mcp::ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .enable_tool_list_changed()
                .enable_resources()
                .enable_resources_list_changed()
                .enable_prompts()
                .enable_prompts_list_changed()
                .build(),
            server_info: mcp::Implementation {
                name: self.name.clone(),
                version: "0.0.0-test".into(),
                title: None,
                website_url: None,
                icons: None,
            },
            instructions: Some(format!("Guidance from {}.", self.name)),
        }
    }

    fn tool_list(&self) -> Vec<mcp::Tool> {
        self.tools
            .iter()
            .map(|name| {
                mcp::Tool::new(
                    name.clone(),
                    format!("{name} from {}", self.name),
                    serde_json::Map::new(),
                )
            })
            .collect()
    }

    fn prompt_list(&self) -> Vec<mcp::Prompt> {
        self.prompts
            .iter()
            .map(|name| {
                serde_json::from_value(serde_json::json!({ "name": name })).expect("prompt shape")
            })
            .collect()
    }

    fn resource_list(&self) -> Vec<mcp::Resource> {
        self.resources
            .iter()
            .map(|uri| {
                serde_json::from_value(serde_json::json!({ "uri": uri, "name": uri }))
                    .expect("resource shape")
            })
            .collect()
    }
}

impl Service<RoleServer> for MockOutbound {
    fn handle_request(
        &self,
        request: mcp::ClientRequest,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<mcp::ServerResult, mcp::ErrorData>> + Send {
        let this = self.clone();
        async move {
            match request {
                mcp::ClientRequest::InitializeRequest(_) => Ok(
                    mcp::ServerResult::InitializeResult(this.initialize_result()),
                ),
                mcp::ClientRequest::PingRequest(_) => Ok(mcp::ServerResult::empty(())),
                mcp::ClientRequest::ListToolsRequest(_) => {
                    Ok(mcp::ServerResult::ListToolsResult(mcp::ListToolsResult {
                        tools: this.tool_list(),
                        next_cursor: None,
                    }))
                }
                mcp::ClientRequest::ListPromptsRequest(_) => Ok(
                    mcp::ServerResult::ListPromptsResult(mcp::ListPromptsResult {
                        prompts: this.prompt_list(),
                        next_cursor: None,
                    }),
                ),
                mcp::ClientRequest::ListResourcesRequest(_) => Ok(
                    mcp::ServerResult::ListResourcesResult(mcp::ListResourcesResult {
                        resources: this.resource_list(),
                        next_cursor: None,
                    }),
                ),
                mcp::ClientRequest::CallToolRequest(req) => {
                    let started = Instant::now();
                    if !this.call_delay.is_zero() {
                        tokio::time::sleep(this.call_delay).await;
                    }
                    let tool = req.params.name.to_string();
                    this.calls
                        .lock()
                        .unwrap()
                        .push((tool.clone(), started, Instant::now()));
                    Ok(mcp::ServerResult::CallToolResult(mcp::CallToolResult {
                        content: vec![mcp::Content::text(format!("{}::{tool}", this.name))],
                        structured_content: None,
                        is_error: Some(false),
                        meta: None,
                    }))
                }
                mcp::ClientRequest::GetPromptRequest(_) => {
                    Ok(mcp::ServerResult::GetPromptResult(
                        serde_json::from_value(serde_json::json!({ "messages": [] }))
                            .expect("prompt result shape"),
                    ))
                }
                mcp::ClientRequest::ReadResourceRequest(req) => {
                    Ok(mcp::ServerResult::ReadResourceResult(
                        serde_json::from_value(serde_json::json!({
                            "contents": [{ "uri": req.params.uri, "text": this.name }]
                        }))
                        .expect("resource result shape"),
                    ))
                }
                _ => Ok(mcp::ServerResult::empty(())),
            }
        }
    }

    fn handle_notification(
        &self,
        _notification: mcp::ClientNotification,
        _context: NotificationContext<RoleServer>,
    ) -> impl Future<Output = Result<(), mcp::ErrorData>> + Send {
        async move { Ok(()) }
    }

    fn get_info(&self) -> mcp::ServerInfo {
        self.initialize_result()
    }
}

/// Client-side service that records server notifications by method name.
#[derive(Clone, Default)]
pub struct RecordingClient {
    pub notifications: Arc<Mutex<Vec<String>>>,
}

impl RecordingClient {
    pub fn count(&self, method: &str) -> usize {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

impl Service<RoleClient> for RecordingClient {
    fn handle_request(
        &self,
        _request: mcp::ServerRequest,
        _context: RequestContext<RoleClient>,
    ) -> impl Future<Output = Result<mcp::ClientResult, mcp::ErrorData>> + Send {
        async move { Ok(mcp::ClientResult::empty(())) }
    }

    fn handle_notification(
        &self,
        notification: mcp::ServerNotification,
        _context: NotificationContext<RoleClient>,
    ) -> impl Future<Output = Result<(), mcp::ErrorData>> + Send {
        let log = self.notifications.clone();
        async move {
            let method = match notification {
                mcp::ServerNotification::ToolListChangedNotification(_) => {
                    "notifications/tools/list_changed"
                }
                mcp::ServerNotification::ResourceListChangedNotification(_) => {
                    "notifications/resources/list_changed"
                }
                mcp::ServerNotification::PromptListChangedNotification(_) => {
                    "notifications/prompts/list_changed"
                }
                mcp::ServerNotification::ProgressNotification(_) => "notifications/progress",
                mcp::ServerNotification::LoggingMessageNotification(_) => "notifications/message",
                _ => "other",
            };
            log.lock().unwrap().push(method.to_string());
            Ok(())
        }
    }

    fn get_info(&self) -> mcp::ClientInfo {
        mcp::ClientInfo {
            protocol_version: mcp::ProtocolVersion::default(),
            capabilities: mcp::ClientCapabilities::default(),
            client_info: mcp::Implementation {
                name: "onemcp-test-client".into(),
                version: "0.0.0".into(),
                title: None,
                website_url: None,
                icons: None,
            },
        }
    }
}

pub struct TestHarness {
    pub runtime: Arc<ProxyRuntime>,
    pub notify: NotifyHandle,
    pub addr: std::net::SocketAddr,
    pub shutdown: CancellationToken,
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.server_handle.abort();
    }
}

/// Spin up the full aggregation runtime plus the HTTP surface on an
/// ephemeral port. No outbound servers are dialed; tests attach mocks.
pub async fn start_harness() -> TestHarness {
    let cp = Arc::new(TestProvider::new());
    let shutdown = CancellationToken::new();
    let (runtime, notifications) = ProxyRuntime::new(cp, LoadingOptions::default());
    let notify = notify::spawn(runtime.clone(), notifications, shutdown.clone());
    let (server_handle, addr) = start_http_server(
        runtime.clone(),
        notify.clone(),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .expect("start http server");
    TestHarness {
        runtime,
        notify,
        addr,
        shutdown,
        server_handle,
    }
}

/// Register a mock outbound under `tags` and promote it to Ready through
/// an in-process duplex session.
pub async fn attach_mock(
    harness: &TestHarness,
    tags: &[&str],
    mock: MockOutbound,
) -> Arc<OutboundConnection> {
    let descriptor: ServerDescriptor = serde_json::from_value(serde_json::json!({
        "name": mock.name,
        "command": "in-process",
        "tags": tags,
    }))
    .expect("descriptor shape");
    let conn = OutboundConnection::new(descriptor, harness.runtime.events.clone())
        .expect("connection");
    harness.runtime.registry.insert(conn.clone());

    let (proxy_side, mock_side) = tokio::io::duplex(64 * 1024);
    let server_mock = mock.clone();
    tokio::spawn(async move {
        let (read, write) = tokio::io::split(mock_side);
        match serve_server(server_mock, (read, write)).await {
            Ok(running) => {
                let _ = running.waiting().await;
            }
            Err(e) => eprintln!("mock outbound failed to serve: {e}"),
        }
    });

    let (read, write) = tokio::io::split(proxy_side);
    let sink = OutboundSink::new(mock.name.clone(), harness.runtime.notification_sender());
    let running = serve_client(sink, (read, write))
        .await
        .expect("connect mock outbound");
    conn.attach(running);
    conn
}

/// Connect an inbound MCP client to the harness with the given query
/// string (e.g. `"?tags=web"`).
pub async fn connect_client(
    harness: &TestHarness,
    query: &str,
) -> (RunningService<RoleClient, RecordingClient>, RecordingClient) {
    let url = format!("http://{}/mcp{query}", harness.addr);
    let recorder = RecordingClient::default();
    let transport = StreamableHttpClientTransport::from_uri(url);
    let client = serve_client(recorder.clone(), transport)
        .await
        .expect("connect inbound client");
    (client, recorder)
}

/// Poll until `check` passes or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Tool names visible to `client`, sorted.
pub async fn tool_names(client: &Peer<RoleClient>) -> Vec<String> {
    let mut names: Vec<String> = client
        .list_all_tools()
        .await
        .expect("list tools")
        .into_iter()
        .map(|t| t.name.to_string())
        .collect();
    names.sort();
    names
}
