pub mod restart;

use std::{collections::HashMap, sync::Arc};

use rmcp::{
    RoleClient,
    serve_client,
    service::{RunningService, Service},
    transport::{
        SseClientTransport, StreamableHttpClientTransport,
        sse_client::SseClientConfig,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};

use crate::config::{ConfigProvider, ServerDescriptor, TransportKind};
use crate::error::ProxyError;
use crate::oauth;
use crate::transport::restart::{RestartState, RestartableChildProcess, StdioLaunchSpec};

/// A validated, dialable description of one outbound transport.
///
/// `timeout_ms` and `tags` ride along on the spec so downstream layers
/// never need to reparse the descriptor.
#[derive(Debug, Clone)]
pub struct TransportSpec {
    pub descriptor: ServerDescriptor,
    pub kind: TransportKind,
}

impl TransportSpec {
    pub fn new(descriptor: ServerDescriptor) -> Result<Self, ProxyError> {
        descriptor.validate()?;
        let kind = descriptor.transport_kind()?;
        Ok(Self { descriptor, kind })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn call_timeout_ms(&self) -> u64 {
        self.descriptor.call_timeout_ms()
    }

    fn stdio_launch_spec(&self) -> StdioLaunchSpec {
        let desc = &self.descriptor;
        let mut env: Vec<(String, String)> = Vec::new();
        if desc.inherit_parent_env {
            for (k, v) in std::env::vars() {
                if desc.env_filter.is_empty()
                    || desc.env_filter.iter().any(|p| env_pattern_matches(p, &k))
                {
                    env.push((k, v));
                }
            }
        }
        for (k, v) in &desc.env {
            env.push((k.clone(), v.clone()));
        }
        StdioLaunchSpec {
            server_name: desc.name.clone(),
            command: desc.command.clone().unwrap_or_default(),
            args: desc.args.clone(),
            cwd: desc.cwd.clone(),
            env,
            clear_env: true,
            stderr_mode: desc.stderr_mode,
        }
    }

    /// Dial the outbound server and run `service` over the resulting
    /// transport. HTTP transports get the stored OAuth client when one
    /// exists; stdio transports never do.
    pub async fn dial<S>(
        &self,
        cp: &dyn ConfigProvider,
        service: S,
    ) -> Result<DialOutcome<S>, ProxyError>
    where
        S: Service<RoleClient> + Send + 'static,
    {
        let name = self.name().to_string();
        tracing::info!(target = "transport", server = %name, kind = ?self.kind, "dialing");
        match self.kind {
            TransportKind::Stdio => {
                let launch = self.stdio_launch_spec();
                if self.descriptor.restart.on_exit {
                    let transport =
                        RestartableChildProcess::start(launch, self.descriptor.restart.clone())
                            .map_err(|e| ProxyError::TransportDial(e.to_string()))?;
                    let restart = transport.state();
                    let running = serve_client(service, transport)
                        .await
                        .map_err(|e| ProxyError::TransportDial(e.to_string()))?;
                    Ok(DialOutcome {
                        running,
                        restart: Some(restart),
                    })
                } else {
                    let transport = launch
                        .spawn()
                        .map_err(|e| ProxyError::TransportDial(e.to_string()))?;
                    let running = serve_client(service, transport)
                        .await
                        .map_err(|e| ProxyError::TransportDial(e.to_string()))?;
                    Ok(DialOutcome {
                        running,
                        restart: None,
                    })
                }
            }
            TransportKind::Http => {
                let endpoint = self.descriptor.url.clone().unwrap_or_default();
                match oauth::build_auth_client(cp, &name, &endpoint).await {
                    Ok(Some(client)) => {
                        let transport = StreamableHttpClientTransport::with_client(
                            client,
                            StreamableHttpClientTransportConfig::with_uri(endpoint.clone()),
                        );
                        serve_client(service, transport)
                            .await
                            .map_err(|e| self.classify_http_error(e))
                            .map(|running| DialOutcome {
                                running,
                                restart: None,
                            })
                    }
                    Ok(None) => {
                        let client = http_client_with_headers(&self.descriptor)?;
                        let transport = StreamableHttpClientTransport::with_client(
                            client,
                            StreamableHttpClientTransportConfig::with_uri(endpoint.clone()),
                        );
                        serve_client(service, transport)
                            .await
                            .map_err(|e| self.classify_http_error(e))
                            .map(|running| DialOutcome {
                                running,
                                restart: None,
                            })
                    }
                    Err(e) => Err(ProxyError::TransportDial(format!("{e:#}"))),
                }
            }
            TransportKind::Sse => {
                let endpoint = self.descriptor.url.clone().unwrap_or_default();
                let client = http_client_with_headers(&self.descriptor)?;
                let transport = SseClientTransport::start_with_client(
                    client,
                    SseClientConfig {
                        sse_endpoint: endpoint.into(),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| self.classify_http_error(e))?;
                let running = serve_client(service, transport)
                    .await
                    .map_err(|e| self.classify_http_error(e))?;
                Ok(DialOutcome {
                    running,
                    restart: None,
                })
            }
        }
    }

    fn classify_http_error(&self, err: impl std::fmt::Display) -> ProxyError {
        if oauth::looks_unauthorized(&err.to_string()) {
            ProxyError::AwaitingOauth(self.name().to_string())
        } else {
            ProxyError::TransportDial(err.to_string())
        }
    }
}

pub struct DialOutcome<S: Service<RoleClient>> {
    pub running: RunningService<RoleClient, S>,
    pub restart: Option<Arc<RestartState>>,
}

fn http_client_with_headers(desc: &ServerDescriptor) -> Result<reqwest::Client, ProxyError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in &desc.headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| ProxyError::Validation(format!("invalid header name {k}")))?;
        let val = reqwest::header::HeaderValue::from_str(v)
            .map_err(|_| ProxyError::Validation(format!("invalid header value for {k}")))?;
        map.insert(name, val);
    }
    reqwest::Client::builder()
        .default_headers(map)
        .build()
        .map_err(|e| ProxyError::Internal(e.to_string()))
}

/// Environment filter patterns: `*` at either end is a wildcard, anything
/// else matches exactly.
fn env_pattern_matches(pattern: &str, key: &str) -> bool {
    match (pattern.strip_prefix('*'), pattern.strip_suffix('*')) {
        (Some(suffix), _) => key.ends_with(suffix),
        (_, Some(prefix)) => key.starts_with(prefix),
        _ => pattern == key,
    }
}

/// Build dialable specs for a descriptor set. Each entry validates
/// independently; one malformed server never blocks the rest.
pub fn build_transport_specs(
    descriptors: &[ServerDescriptor],
) -> (HashMap<String, TransportSpec>, Vec<(String, ProxyError)>) {
    let mut specs = HashMap::new();
    let mut failures = Vec::new();
    for desc in descriptors {
        if desc.disabled {
            continue;
        }
        match TransportSpec::new(desc.clone()) {
            Ok(spec) => {
                specs.insert(desc.name.clone(), spec);
            }
            Err(e) => failures.push((desc.name.clone(), e)),
        }
    }
    (specs, failures)
}
