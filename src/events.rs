use tokio::sync::broadcast;

use crate::aggregator::CapabilityChanges;
use crate::loader::LoadingSummary;
use crate::outbound::ConnectionState;

/// Events published by the aggregation runtime.
///
/// Fan-out is a bounded broadcast channel; receivers that fall behind drop
/// the oldest events rather than stalling the publisher.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
    StatusChanged {
        server: String,
        state: ConnectionState,
    },
    ServerReady {
        server: String,
    },
    LoadingProgress(LoadingSummary),
    LoadingComplete(LoadingSummary),
    CapabilitiesChanged(CapabilityChanges),
    PresetSaved {
        name: String,
    },
    PresetDeleted {
        name: String,
    },
    ConfigReloaded,
}

const EVENT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_QUEUE_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ProxyEvent) {
        // Err means no subscriber is listening, which is fine at startup
        // and during shutdown.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_see_published_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(ProxyEvent::ServerReady { server: "x".into() });
        for rx in [&mut a, &mut b] {
            match rx.recv().await.unwrap() {
                ProxyEvent::ServerReady { server } => assert_eq!(server, "x"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let bus = EventBus::new();
        bus.publish(ProxyEvent::ConfigReloaded);
        let mut rx = bus.subscribe();
        bus.publish(ProxyEvent::ConfigReloaded);
        assert!(matches!(rx.recv().await.unwrap(), ProxyEvent::ConfigReloaded));
    }
}
