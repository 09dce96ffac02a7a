//! Bundles and the collaborators that run them.

use crate::audit::AuditBuffer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Ordered set of scripts or recipes applied as one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    /// Bundle name, e.g. `boot`
    pub name: String,
    /// Scripts and recipes, in run order
    #[serde(default)]
    pub executables: Vec<String>,
}

impl Bundle {
    /// Bundle `name` running `executables` in order
    pub fn new(name: impl Into<String>, executables: Vec<String>) -> Self {
        Self {
            name: name.into(),
            executables,
        }
    }

    /// Human readable description used in audits
    pub fn description(&self) -> String {
        if self.executables.is_empty() {
            self.name.clone()
        } else {
            format!("{} ({})", self.name, self.executables.join(", "))
        }
    }
}

/// A bundle queued for execution together with the audit it reports to
#[derive(Debug)]
pub struct BundleContext {
    /// Unique per queued run
    pub id: Uuid,
    /// What to run
    pub bundle: Bundle,
    /// Where converge output goes
    pub audit: AuditBuffer,
    /// Runs even during an immediate shutdown
    pub decommission: bool,
    /// Set from the converge outcome
    pub succeeded: bool,
}

impl BundleContext {
    /// Ordinary context reporting to `audit`
    pub fn new(bundle: Bundle, audit: AuditBuffer) -> Self {
        Self {
            id: Uuid::new_v4(),
            bundle,
            audit,
            decommission: false,
            succeeded: false,
        }
    }

    /// Context for the bundle that tears the instance down
    pub fn decommission(bundle: Bundle, audit: AuditBuffer) -> Self {
        Self {
            decommission: true,
            ..Self::new(bundle, audit)
        }
    }

    /// See [`Bundle::description`]
    pub fn description(&self) -> String {
        self.bundle.description()
    }
}

/// Result of a converge run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvergeOutcome {
    /// Every executable succeeded
    pub succeeded: bool,
    /// Changes to node inputs produced by the run
    pub inputs_delta: Option<Value>,
}

impl ConvergeOutcome {
    /// Successful run without input changes
    pub fn success() -> Self {
        Self {
            succeeded: true,
            inputs_delta: None,
        }
    }

    /// Failed run
    pub fn failure() -> Self {
        Self::default()
    }
}

/// Applies a bundle to the instance
#[async_trait]
pub trait Converger: Send + Sync {
    /// Run the bundle to completion. Never called concurrently by the queue.
    async fn converge(&self, context: &BundleContext) -> ConvergeOutcome;
}

/// Continuation the shutdown authority calls once the shutdown is scheduled,
/// with the decommission bundle to run next if there is one
pub type ScheduledHook = Box<dyn FnOnce(Option<BundleContext>) + Send>;

/// Decides how bundles behave while a shutdown is pending
#[async_trait]
pub trait ShutdownAuthority: Send + Sync {
    /// Bundles other than decommission must be skipped
    fn is_immediate(&self) -> bool;

    /// Start handling a requested shutdown.
    ///
    /// Should call `on_scheduled` once. The bundle queue stays paused until
    /// it does, and runs the handed-back context ahead of everything still
    /// queued. Returning or panicking without calling it resumes the queue
    /// with nothing to decommission.
    async fn manage_shutdown_request(&self, audit: AuditBuffer, on_scheduled: ScheduledHook);
}
