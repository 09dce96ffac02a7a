//! Destinations for audit entries.

use super::entry::{AuditEntry, AuditId, EventCategory};
use crate::coordinator::RequestOptions;
use crate::errors::TransportError;
use crate::forwarder::ForwarderHandle;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const CREATE_ENTRY_TARGET: &str = "/auditor/create_entry";
const UPDATE_ENTRY_TARGET: &str = "/auditor/update_entry";

/// Where audit entries go
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Open a new audit and return its id.
    async fn create_entry(
        &self,
        summary: &str,
        category: EventCategory,
    ) -> Result<AuditId, TransportError>;

    /// Send an update. Delivery is best effort.
    fn update_entry(&self, entry: AuditEntry);
}

/// Sends audits to the coordinator through the offline forwarder, so
/// entries written during an outage are replayed in order.
#[derive(Clone)]
pub struct ForwarderAuditSink {
    forwarder: ForwarderHandle,
}

impl ForwarderAuditSink {
    /// Sink sending through `forwarder`
    pub fn new(forwarder: ForwarderHandle) -> Self {
        Self { forwarder }
    }
}

fn parse_audit_id(response: &Value) -> Option<AuditId> {
    response
        .as_u64()
        .or_else(|| response.get("audit_id").and_then(Value::as_u64))
}

#[async_trait]
impl AuditSink for ForwarderAuditSink {
    async fn create_entry(
        &self,
        summary: &str,
        category: EventCategory,
    ) -> Result<AuditId, TransportError> {
        let payload = json!({ "summary": summary, "category": category });
        let reply = self
            .forwarder
            .request(CREATE_ENTRY_TARGET, payload, RequestOptions::default())
            .map_err(|_| TransportError::Abandoned)?;
        let response = reply.response().await?;
        parse_audit_id(&response).ok_or_else(|| {
            TransportError::Remote(format!("create_entry returned no audit id: {response}"))
        })
    }

    fn update_entry(&self, entry: AuditEntry) {
        let payload = match serde_json::to_value(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(audit_id = entry.audit_id, "Failed to encode audit entry: {}", e);
                return;
            }
        };
        let options = RequestOptions {
            persistent: true,
            ..RequestOptions::default()
        };
        if let Err(e) = self.forwarder.push(UPDATE_ENTRY_TARGET, payload, options) {
            warn!(audit_id = entry.audit_id, "Dropped audit entry: {}", e);
        }
    }
}

/// Writes entries to the log only.
///
/// Used for audits that could not be opened on the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn create_entry(
        &self,
        summary: &str,
        category: EventCategory,
    ) -> Result<AuditId, TransportError> {
        info!(%category, "Detached audit: {}", summary);
        Ok(0)
    }

    fn update_entry(&self, entry: AuditEntry) {
        debug!(
            kind = ?entry.kind,
            category = %entry.category,
            offset = entry.offset,
            "Detached audit entry: {}",
            entry.text
        );
    }
}
