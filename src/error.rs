use rmcp::model::ErrorData;
use thiserror::Error;

/// Error kinds surfaced by the aggregation runtime.
///
/// Only the request-scoped kinds ever reach an inbound caller; background
/// failures are logged and reflected in health state instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("dial failed: {0}")]
    TransportDial(String),

    #[error("restart budget exhausted after {0} restarts")]
    TransportExhausted(u32),

    #[error("server '{0}' is awaiting authorization")]
    AwaitingOauth(String),

    #[error("call to '{0}' timed out after {1}ms")]
    CallTimeout(String, u64),

    #[error("server '{0}' is not available")]
    ServerUnavailable(String),

    #[error("'{0}' is not allowed for this session")]
    NotAllowed(String),

    #[error("unknown {0} '{1}'")]
    NotFound(&'static str, String),

    #[error("storage: {0}")]
    Storage(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ProxyError> for ErrorData {
    fn from(err: ProxyError) -> Self {
        match &err {
            ProxyError::Validation(_) => ErrorData::invalid_params(err.to_string(), None),
            ProxyError::NotFound(_, _) => ErrorData::invalid_params(err.to_string(), None),
            ProxyError::NotAllowed(_) => ErrorData::invalid_request(err.to_string(), None),
            _ => ErrorData::internal_error(err.to_string(), None),
        }
    }
}

impl From<anyhow::Error> for ProxyError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
