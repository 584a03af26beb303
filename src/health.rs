use serde::Serialize;

use crate::loader::{LoadingManager, LoadingSummary};
use crate::outbound::{ConnectionState, OutboundConnection};

/// Read-only health projection of one outbound connection.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub name: String,
    pub state: ConnectionState,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub message: String,
}

/// Aggregate health over all outbound connections.
#[derive(Debug, Clone, Serialize)]
pub struct HealthAggregate {
    #[serde(flatten)]
    pub summary: LoadingSummary,
}

fn message_for(state: ConnectionState) -> &'static str {
    match state {
        ConnectionState::Idle => "not yet dialed",
        ConnectionState::Connecting => "connecting",
        ConnectionState::Ready => "serving requests",
        ConnectionState::Disconnected => "transport closed, retrying in background",
        ConnectionState::Failed => "failed, retrying in background",
        ConnectionState::AwaitingOauth => "waiting for user authorization",
    }
}

pub fn record(conn: &OutboundConnection) -> HealthRecord {
    let state = conn.state();
    HealthRecord {
        name: conn.name().to_string(),
        state,
        duration_ms: conn.state_duration_ms(),
        retry_count: conn.retry_count(),
        last_error: conn.last_error(),
        message: message_for(state).to_string(),
    }
}

pub fn aggregate(loader: &LoadingManager) -> HealthAggregate {
    HealthAggregate {
        summary: loader.summary(),
    }
}
