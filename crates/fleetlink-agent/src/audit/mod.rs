//! Audit entries, sinks and output buffering.

pub mod buffer;
pub mod entry;
pub mod sink;

pub use buffer::{AuditBuffer, AuditFactory};
pub use entry::{AuditEntry, AuditEntryKind, AuditId, EventCategory};
pub use sink::{AuditSink, ForwarderAuditSink, LogAuditSink};
