//! Coordinator RPC surface consumed by the agent.
//!
//! The transport and broker protocol live elsewhere; the agent only needs
//! the three calls below.

use crate::errors::{RecordStateError, TransportError};
use crate::lifecycle::LifecycleState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-call delivery options passed through to the transport untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Correlation token chosen by the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Ask the broker to persist the message
    #[serde(default)]
    pub persistent: bool,

    /// Drop the message if it has not been delivered within this many seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

/// Calls the agent makes against its fleet coordinator
#[async_trait]
pub trait CoordinatorClient: Send + Sync {
    /// Idempotent report of a lifecycle transition.
    async fn record_state(
        &self,
        identity: &str,
        state: LifecycleState,
        from_state: Option<LifecycleState>,
    ) -> Result<(), RecordStateError>;

    /// Request expecting a response.
    async fn request(
        &self,
        target: &str,
        payload: Value,
        opts: &RequestOptions,
    ) -> Result<Value, TransportError>;

    /// Fire-and-forget push.
    async fn push(
        &self,
        target: &str,
        payload: Value,
        opts: &RequestOptions,
    ) -> Result<(), TransportError>;
}
