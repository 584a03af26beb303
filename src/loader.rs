use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigProvider, DescriptorDiff, LoadingOptions, ServerDescriptor};
use crate::error::ProxyError;
use crate::events::{EventBus, ProxyEvent};
use crate::outbound::{ConnectionState, OutboundConnection, OutboundNotification, OutboundRegistry};

const BACKOFF_CAP: Duration = Duration::from_secs(30);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Aggregate progress over all configured outbound servers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadingSummary {
    pub total: usize,
    pub ready: usize,
    pub loading: usize,
    pub failed: usize,
    pub awaiting_oauth: usize,
    pub success_rate: f64,
    pub avg_load_time_ms: u64,
    pub is_complete: bool,
}

/// Exponential backoff with ±20% jitter, capped at 30s.
pub fn backoff_delay(attempt: u32, base_ms: u64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(BACKOFF_CAP.as_millis() as u64);
    let jitter_span = capped / 5;
    let jittered = if jitter_span > 0 {
        let offset = rand::thread_rng().gen_range(0..=jitter_span * 2);
        capped - jitter_span + offset
    } else {
        capped
    };
    Duration::from_millis(jittered.min(BACKOFF_CAP.as_millis() as u64))
}

/// Dials configured servers with bounded parallelism, then keeps retrying
/// failed ones in the background. The sole writer of the outbound registry.
pub struct LoadingManager {
    cp: Arc<dyn ConfigProvider>,
    registry: Arc<OutboundRegistry>,
    events: EventBus,
    options: LoadingOptions,
    notifications: mpsc::Sender<OutboundNotification>,
    shutdown: CancellationToken,
}

impl LoadingManager {
    pub fn new(
        cp: Arc<dyn ConfigProvider>,
        registry: Arc<OutboundRegistry>,
        events: EventBus,
        options: LoadingOptions,
        notifications: mpsc::Sender<OutboundNotification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cp,
            registry,
            events,
            options,
            notifications,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<OutboundRegistry> {
        self.registry.clone()
    }

    pub fn summary(&self) -> LoadingSummary {
        let snapshot = self.registry.snapshot();
        let mut summary = LoadingSummary {
            total: snapshot.len(),
            ..Default::default()
        };
        let mut load_times = Vec::new();
        for conn in snapshot.values() {
            match conn.state() {
                ConnectionState::Ready => {
                    summary.ready += 1;
                    if let Some(ms) = conn.load_time_ms() {
                        load_times.push(ms);
                    }
                }
                ConnectionState::Failed => summary.failed += 1,
                ConnectionState::AwaitingOauth => summary.awaiting_oauth += 1,
                ConnectionState::Idle
                | ConnectionState::Connecting
                | ConnectionState::Disconnected => summary.loading += 1,
            }
        }
        if summary.total > 0 {
            summary.success_rate = summary.ready as f64 / summary.total as f64;
        }
        if !load_times.is_empty() {
            summary.avg_load_time_ms = load_times.iter().sum::<u64>() / load_times.len() as u64;
        }
        summary.is_complete = summary.loading == 0;
        summary
    }

    /// Initial load: every descriptor is dialed under the concurrency
    /// semaphore and retried with backoff until it lands in
    /// Ready/Failed/AwaitingOauth. Returns the final summary; the inbound
    /// surface does not wait on it.
    pub async fn load(self: &Arc<Self>, descriptors: Vec<ServerDescriptor>) -> LoadingSummary {
        for desc in &descriptors {
            match OutboundConnection::new(desc.clone(), self.events.clone()) {
                Ok(conn) => self.registry.insert(conn),
                Err(e) => {
                    tracing::warn!(target = "loader", server = %desc.name, "rejected: {e}");
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.options.max_concurrent_loads.max(1)));
        let abort = CancellationToken::new();
        let snapshot = self.registry.snapshot();
        let tasks = snapshot.values().cloned().map(|conn| {
            let manager = self.clone();
            let semaphore = semaphore.clone();
            let abort = abort.clone();
            async move {
                let _permit = semaphore.acquire().await;
                if abort.is_cancelled() || manager.shutdown.is_cancelled() {
                    return;
                }
                let ok = manager.dial_with_retries(&conn).await;
                if !ok && !manager.options.continue_on_failure {
                    abort.cancel();
                }
            }
        });
        join_all(tasks.collect::<Vec<_>>()).await;

        let summary = self.summary();
        tracing::info!(
            target = "loader",
            ready = summary.ready,
            failed = summary.failed,
            awaiting_oauth = summary.awaiting_oauth,
            total = summary.total,
            "initial load complete"
        );
        self.events.publish(ProxyEvent::LoadingComplete(summary.clone()));

        if self.options.enable_background_retry {
            self.spawn_background_retry();
        }
        summary
    }

    async fn dial_with_retries(self: &Arc<Self>, conn: &Arc<OutboundConnection>) -> bool {
        for attempt in 0..=self.options.max_retries {
            if self.shutdown.is_cancelled() {
                return false;
            }
            if self.dial_once(conn).await {
                return true;
            }
            if conn.state() == ConnectionState::AwaitingOauth {
                // Visible state; resumes when authorization completes.
                return false;
            }
            if attempt < self.options.max_retries {
                let delay = backoff_delay(attempt, self.options.retry_delay_ms);
                tracing::debug!(
                    target = "loader",
                    server = %conn.name(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        false
    }

    async fn dial_once(self: &Arc<Self>, conn: &Arc<OutboundConnection>) -> bool {
        let timeout = Duration::from_millis(self.options.server_timeout_ms);
        let result = tokio::time::timeout(
            timeout,
            conn.connect(self.cp.as_ref(), self.notifications.clone()),
        )
        .await;
        let ok = match result {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                conn.mark_failed(&ProxyError::TransportDial(format!(
                    "dial timed out after {}ms",
                    timeout.as_millis()
                )));
                false
            }
        };
        self.events.publish(ProxyEvent::LoadingProgress(self.summary()));
        ok
    }

    fn spawn_background_retry(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let interval = Duration::from_millis(manager.options.background_retry_interval_ms);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                for conn in manager.registry.snapshot().values() {
                    if manager.shutdown.is_cancelled() {
                        break;
                    }
                    if !conn.state().is_retryable() {
                        continue;
                    }
                    let prior = conn.state();
                    tracing::debug!(target = "loader", server = %conn.name(), "background retry");
                    if !manager.dial_once(conn).await && conn.state() != ConnectionState::AwaitingOauth
                    {
                        // A failed background attempt leaves the prior state
                        // visible, with last_error refreshed.
                        conn.restore_state(prior, conn.last_error());
                    }
                }
            }
        });
    }

    /// Apply a config reload: dial added servers, close removed ones,
    /// close-and-redial changed ones.
    pub async fn apply_diff(self: &Arc<Self>, diff: DescriptorDiff) {
        for name in &diff.removed {
            if let Some(conn) = self.registry.remove(name) {
                conn.close();
                tracing::info!(target = "loader", server = %name, "removed");
            }
        }
        let mut to_dial = Vec::new();
        for desc in diff.changed.iter().chain(diff.added.iter()) {
            if let Some(old) = self.registry.remove(&desc.name) {
                old.close();
            }
            match OutboundConnection::new(desc.clone(), self.events.clone()) {
                Ok(conn) => {
                    self.registry.insert(conn.clone());
                    to_dial.push(conn);
                }
                Err(e) => {
                    tracing::warn!(target = "loader", server = %desc.name, "rejected: {e}");
                }
            }
        }
        for conn in to_dial {
            let manager = self.clone();
            tokio::spawn(async move {
                manager.dial_with_retries(&conn).await;
            });
        }
        self.events.publish(ProxyEvent::ConfigReloaded);
    }

    /// Cancel the background loop, give in-flight dials a grace period,
    /// then close every transport.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.summary().is_complete {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for conn in self.registry.snapshot().values() {
            conn.close();
        }
    }
}

/// Watch `mcp.json` by polling its mtime; on change, reload, diff the
/// descriptor set, and drive connection transitions through the loader.
pub fn spawn_config_watcher(
    manager: Arc<LoadingManager>,
    mut previous: Vec<ServerDescriptor>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    const POLL_INTERVAL: Duration = Duration::from_secs(2);
    tokio::spawn(async move {
        let path = crate::config::mcp_config_path(manager.cp.as_ref());
        let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
            if mtime == last_mtime {
                continue;
            }
            last_mtime = mtime;
            match crate::config::load_config_with(manager.cp.as_ref()) {
                Ok(config) => {
                    let current = config.descriptors();
                    let diff = crate::config::diff_descriptors(&previous, &current);
                    if diff.is_empty() {
                        continue;
                    }
                    tracing::info!(
                        target = "config",
                        added = diff.added.len(),
                        removed = diff.removed.len(),
                        changed = diff.changed.len(),
                        "configuration reloaded"
                    );
                    previous = current;
                    manager.apply_diff(diff).await;
                }
                Err(e) => {
                    tracing::warn!(target = "config", "reload failed, keeping previous: {e}");
                }
            }
        }
    })
}
