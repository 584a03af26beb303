use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use tower::ServiceExt as _;

use crate::health;
use crate::notify::NotifyHandle;
use crate::router::ProxyService;
use crate::runtime::ProxyRuntime;
use crate::session::FilterSpec;

type McpService = StreamableHttpService<ProxyService, LocalSessionManager>;

struct HttpState {
    runtime: Arc<ProxyRuntime>,
    notify: NotifyHandle,
    /// One streamable-HTTP service per distinct filter; sessions that share
    /// a filter share the service, each still getting its own
    /// `ProxyService` from the session factory.
    services: Mutex<HashMap<String, McpService>>,
}

impl HttpState {
    fn service_for(&self, filter: FilterSpec, enable_pagination: bool) -> McpService {
        let key = format!("{}|page={enable_pagination}", filter.cache_key());
        let mut services = self.services.lock().expect("services lock");
        services
            .entry(key)
            .or_insert_with(|| {
                let runtime = self.runtime.clone();
                let notify = self.notify.clone();
                StreamableHttpService::new(
                    move || {
                        Ok(ProxyService::new(
                            runtime.clone(),
                            notify.clone(),
                            filter.clone(),
                            enable_pagination,
                            None,
                        ))
                    },
                    Default::default(),
                    StreamableHttpServerConfig {
                        stateful_mode: true,
                        sse_keep_alive: Some(std::time::Duration::from_secs(15)),
                    },
                )
            })
            .clone()
    }
}

/// Resolve the filter query parameters; precedence is `preset`, then
/// `tag-filter`, then the deprecated `tags`.
fn filter_from_params(params: &HashMap<String, String>) -> Result<FilterSpec, Response> {
    FilterSpec::from_query_params(
        params.get("preset").map(String::as_str),
        params.get("tag-filter").map(String::as_str),
        params.get("tags").map(String::as_str),
    )
    .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())
}

async fn mcp_endpoint(
    State(state): State<Arc<HttpState>>,
    Query(params): Query<HashMap<String, String>>,
    request: axum::extract::Request,
) -> Response {
    let filter = match filter_from_params(&params) {
        Ok(filter) => filter,
        Err(response) => return response,
    };
    let enable_pagination = params
        .get("pagination")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let service = state.service_for(filter, enable_pagination);
    match service.oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            tracing::error!(target = "server", "mcp service error: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_aggregate(State(state): State<Arc<HttpState>>) -> Response {
    Json(health::aggregate(&state.runtime.loader)).into_response()
}

async fn health_server(
    State(state): State<Arc<HttpState>>,
    Path(name): Path<String>,
) -> Response {
    match state.runtime.registry.get(&name) {
        Some(conn) => Json(health::record(&conn)).into_response(),
        None => (StatusCode::NOT_FOUND, format!("unknown server '{name}'")).into_response(),
    }
}

pub fn build_router(runtime: Arc<ProxyRuntime>, notify: NotifyHandle) -> Router {
    let state = Arc::new(HttpState {
        runtime,
        notify,
        services: Mutex::new(HashMap::new()),
    });
    Router::new()
        .route("/mcp", axum::routing::any(mcp_endpoint))
        .route("/health/mcp", get(health_aggregate))
        .route("/health/mcp/{name}", get(health_server))
        .with_state(state)
}

/// Bind and serve the inbound surface. Returns immediately with the task
/// handle and the bound address; outbound loading continues in the
/// background.
pub async fn start_http_server(
    runtime: Arc<ProxyRuntime>,
    notify: NotifyHandle,
    addr: std::net::SocketAddr,
) -> Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr), String> {
    let router = build_router(runtime, notify);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| e.to_string())?;
    let local = listener.local_addr().map_err(|e| e.to_string())?;
    tracing::info!(target = "server", ip = %local.ip(), port = local.port(), "proxy_listening");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((handle, local))
}

pub fn stop_http_server(handle: &tokio::task::JoinHandle<()>) {
    handle.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadingOptions, OsConfigProvider};
    use tokio_util::sync::CancellationToken;

    async fn test_state() -> (Arc<ProxyRuntime>, NotifyHandle) {
        let (runtime, notif_rx) =
            ProxyRuntime::new(Arc::new(OsConfigProvider), LoadingOptions::default());
        let notify = crate::notify::spawn(runtime.clone(), notif_rx, CancellationToken::new());
        (runtime, notify)
    }

    #[tokio::test]
    async fn server_starts_and_stops() {
        let (runtime, notify) = test_state().await;
        let (handle, addr) =
            start_http_server(runtime, notify, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        assert_ne!(addr.port(), 0);
        stop_http_server(&handle);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }

    #[tokio::test]
    async fn health_endpoint_serves_aggregate() {
        let (runtime, notify) = test_state().await;
        let (handle, addr) =
            start_http_server(runtime, notify, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health/mcp"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["total"], 0);
        assert_eq!(body["is_complete"], true);
        let missing = reqwest::get(format!("http://{addr}/health/mcp/nope"))
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
        stop_http_server(&handle);
    }

    #[tokio::test]
    async fn bad_filter_is_rejected_at_the_boundary() {
        let (runtime, notify) = test_state().await;
        let (handle, addr) =
            start_http_server(runtime, notify, "127.0.0.1:0".parse().unwrap())
                .await
                .unwrap();
        let response = reqwest::Client::new()
            .post(format!("http://{addr}/mcp?tag-filter=web%20and"))
            .json(&serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        stop_http_server(&handle);
    }
}
