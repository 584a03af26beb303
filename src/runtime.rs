use std::sync::Arc;

use tokio::sync::mpsc;

use crate::aggregator::CapabilityAggregator;
use crate::config::{ConfigProvider, LoadingOptions};
use crate::events::EventBus;
use crate::loader::LoadingManager;
use crate::outbound::{OutboundNotification, OutboundRegistry};
use crate::session::SessionRegistry;

/// Capacity of the outbound-notification pipe into the fabric. Beyond this
/// high-water mark the oldest unprocessed notifications are dropped.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 1000;

/// The wired-together aggregation runtime: every component reachable by
/// handle, no hidden globals. One instance owns a process's sessions.
pub struct ProxyRuntime {
    pub cp: Arc<dyn ConfigProvider>,
    pub events: EventBus,
    pub registry: Arc<OutboundRegistry>,
    pub aggregator: Arc<CapabilityAggregator>,
    pub loader: Arc<LoadingManager>,
    pub sessions: Arc<SessionRegistry>,
    notifications_tx: mpsc::Sender<OutboundNotification>,
}

impl ProxyRuntime {
    /// Build the runtime and hand back the notification stream the fabric
    /// consumes.
    pub fn new(
        cp: Arc<dyn ConfigProvider>,
        options: LoadingOptions,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundNotification>) {
        let events = EventBus::new();
        let registry = Arc::new(OutboundRegistry::new());
        let (notif_tx, notif_rx) = mpsc::channel(NOTIFICATION_QUEUE_CAPACITY);
        let loader = LoadingManager::new(
            cp.clone(),
            registry.clone(),
            events.clone(),
            options,
            notif_tx.clone(),
        );
        let aggregator = CapabilityAggregator::new(registry.clone(), events.clone());
        let runtime = Arc::new(Self {
            cp,
            events,
            registry,
            aggregator,
            loader,
            sessions: Arc::new(SessionRegistry::new()),
            notifications_tx: notif_tx,
        });
        (runtime, notif_rx)
    }

    /// Sender feeding the notification fabric; outbound sessions
    /// established out of band plug their sinks in here.
    pub fn notification_sender(&self) -> mpsc::Sender<OutboundNotification> {
        self.notifications_tx.clone()
    }
}
