use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use onemcp::config::{self, ConfigProvider, LoadingOptions, OsConfigProvider};
use onemcp::loader::spawn_config_watcher;
use onemcp::runtime::ProxyRuntime;
use onemcp::server::start_http_server;
use onemcp::{notify, oauth, preset};

/// MCP proxying aggregator: one virtual MCP server in front of many.
#[derive(Debug, Parser)]
#[command(name = "onemcp", version)]
struct Args {
    /// Listen address for the inbound HTTP surface.
    #[arg(long, default_value = "127.0.0.1:3050", env = "ONEMCP_LISTEN")]
    listen: std::net::SocketAddr,

    /// Base directory for config and session state; defaults to the user
    /// config directory.
    #[arg(long, env = "ONEMCP_BASE_DIR")]
    base_dir: Option<std::path::PathBuf>,

    /// Log filter, e.g. "info" or "onemcp=debug".
    #[arg(long, default_value = "info", env = "ONEMCP_LOG")]
    log: String,
}

struct FixedBaseProvider(std::path::PathBuf);

impl ConfigProvider for FixedBaseProvider {
    fn base_dir(&self) -> std::path::PathBuf {
        self.0.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).context("log filter")?)
        .init();

    let cp: Arc<dyn ConfigProvider> = match args.base_dir {
        Some(dir) => Arc::new(FixedBaseProvider(dir)),
        None => Arc::new(OsConfigProvider),
    };

    let cfg = config::load_config_with(cp.as_ref()).context("load mcp.json")?;
    let descriptors = cfg.descriptors();
    let options: LoadingOptions = cfg.loading_options();
    tracing::info!(
        target = "main",
        servers = descriptors.len(),
        config = %config::mcp_config_path(cp.as_ref()).display(),
        "starting"
    );

    let shutdown = CancellationToken::new();
    let (runtime, notifications) = ProxyRuntime::new(cp.clone(), options);
    let _presets = preset::initialize(cp.clone(), runtime.events.clone());
    let notify_handle = notify::spawn(runtime.clone(), notifications, shutdown.clone());
    oauth::spawn_cleanup_sweep(cp.clone(), shutdown.clone());

    // The inbound surface comes up before any outbound server is dialed;
    // clients see servers appear via listChanged as they become ready.
    let (server_handle, addr) = start_http_server(runtime.clone(), notify_handle, args.listen)
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    tracing::info!(target = "main", %addr, "inbound surface available");

    {
        let loader = runtime.loader.clone();
        let watcher_shutdown = shutdown.clone();
        let initial = descriptors.clone();
        tokio::spawn(async move {
            loader.load(initial.clone()).await;
            spawn_config_watcher(loader, initial, watcher_shutdown);
        });
    }

    tokio::signal::ctrl_c().await.context("ctrl-c")?;
    tracing::info!(target = "main", "shutting down");
    shutdown.cancel();
    runtime.loader.shutdown().await;
    onemcp::server::stop_http_server(&server_handle);
    preset::cleanup();
    Ok(())
}
