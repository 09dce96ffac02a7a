//! Audit entry wire types.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Identifier the coordinator assigns to an audit
pub type AuditId = u64;

/// Kind of update sent against an audit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEntryKind {
    /// Replaces the audit's summary line
    Status,
    /// Starts a titled section
    NewSection,
    /// Informational line
    Info,
    /// Error line
    Error,
    /// Converge output, one line per entry
    Output,
    /// Converge output passed through untouched
    RawOutput,
}

impl AuditEntryKind {
    /// Buffered free-form output, as opposed to a structured entry
    pub fn is_output(self) -> bool {
        matches!(self, Self::Output | Self::RawOutput)
    }
}

/// Event category shown next to an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Uncategorized
    #[default]
    None,
    /// Worth telling the operator
    Notification,
    /// Security relevant
    Security,
    /// Something failed
    Error,
}

impl EventCategory {
    /// Every category, in the order labels are matched
    pub const ALL: [EventCategory; 4] = [
        EventCategory::None,
        EventCategory::Notification,
        EventCategory::Security,
        EventCategory::Error,
    ];

    /// Wire label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Notification => "notification",
            Self::Security => "security",
            Self::Error => "error",
        }
    }

    /// Resolve a caller supplied label. Unknown labels fall back to `None`.
    pub fn from_label(label: Option<&str>) -> Self {
        let Some(label) = label else {
            return Self::None;
        };
        let normalized = label.trim().to_ascii_lowercase();
        match Self::ALL.iter().find(|c| c.as_str() == normalized) {
            Some(category) => *category,
            None => {
                warn!(category = label, "Invalid audit category, using none");
                Self::None
            }
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One update sent to the auditor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Audit this update belongs to
    pub audit_id: AuditId,
    /// What the update does
    pub kind: AuditEntryKind,
    /// Update body
    pub text: String,
    /// Category shown with the update
    pub category: EventCategory,
    /// Byte offset of `text` within the audit
    pub offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_labels() {
        assert_eq!(EventCategory::from_label(Some("security")), EventCategory::Security);
        assert_eq!(EventCategory::from_label(Some(" Error ")), EventCategory::Error);
        assert_eq!(EventCategory::from_label(Some("bogus")), EventCategory::None);
        assert_eq!(EventCategory::from_label(None), EventCategory::None);
    }

    #[test]
    fn test_entry_kind_serializes_snake_case() {
        let json = serde_json::to_string(&AuditEntryKind::RawOutput).unwrap();
        assert_eq!(json, "\"raw_output\"");
        assert!(AuditEntryKind::Output.is_output());
        assert!(!AuditEntryKind::NewSection.is_output());
    }
}
