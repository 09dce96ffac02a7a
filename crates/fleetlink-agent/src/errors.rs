//! Agent Error Types
//!
//! Unified error handling for the agent runtime. Failures inside the core
//! services never surface here: they end in a scheduled retry, an audited
//! failure or a re-enrollment vote. These errors cover construction,
//! persistence and calls made against a stopped service.

use crate::lifecycle::LifecycleState;

/// Agent-specific error types
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration error
    #[error("Agent configuration error: {0}")]
    Config(String),

    /// Persisted state could not be read or written
    #[error("State persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Persisted state could not be encoded or decoded
    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The requested lifecycle transition is not allowed
    #[error("Illegal lifecycle state: {0}")]
    IllegalState(LifecycleState),

    /// An unknown lifecycle state label was supplied
    #[error("Unknown lifecycle state: {0}")]
    UnknownState(String),

    /// A mutating call was made against a read-only state machine
    #[error("Lifecycle state was opened read-only")]
    ReadOnly,

    /// The service's task has stopped and can no longer accept commands
    #[error("Service stopped: {0}")]
    ServiceStopped(&'static str),

    /// Transport error from the coordinator link
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Agent result type
pub type AgentResult<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a stopped-service error
    pub fn stopped(service: &'static str) -> Self {
        Self::ServiceStopped(service)
    }
}

/// Errors reported by the coordinator transport.
///
/// Retrying these is the transport's concern; the forwarder only decides
/// whether to buffer or send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The coordinator could not be reached
    #[error("Coordinator unreachable: {0}")]
    Unreachable(String),

    /// The message was accepted by the broker but not delivered
    #[error("Non-delivery: {0}")]
    NonDelivery(String),

    /// The coordinator answered with an error
    #[error("Coordinator error: {0}")]
    Remote(String),

    /// The request was dropped before it was dispatched
    #[error("Request abandoned before dispatch")]
    Abandoned,
}

/// Failure of a `record_state` call.
///
/// When the coordinator knows better, `recorded_state` carries the value it
/// actually has on record and the caller adopts it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to record state: {message}")]
pub struct RecordStateError {
    /// Authoritative state held by the coordinator, if it reported one
    pub recorded_state: Option<LifecycleState>,
    /// Human-readable reason
    pub message: String,
}

impl RecordStateError {
    /// Failure without authoritative state
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            recorded_state: None,
            message: message.into(),
        }
    }

    /// Rejection carrying the coordinator's recorded state
    pub fn rejected(recorded_state: LifecycleState, message: impl Into<String>) -> Self {
        Self {
            recorded_state: Some(recorded_state),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::config("max_queued_requests must be positive");
        assert_eq!(
            err.to_string(),
            "Agent configuration error: max_queued_requests must be positive"
        );

        let err = AgentError::IllegalState(LifecycleState::Pending);
        assert_eq!(err.to_string(), "Illegal lifecycle state: pending");
    }

    #[test]
    fn test_record_state_error_constructors() {
        let err = RecordStateError::rejected(LifecycleState::Operational, "stale");
        assert_eq!(err.recorded_state, Some(LifecycleState::Operational));
        assert!(RecordStateError::transient("timeout").recorded_state.is_none());
    }
}
