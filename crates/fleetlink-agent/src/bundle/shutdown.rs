//! Pending shutdown requests and their handling.

use super::context::{Bundle, BundleContext, ScheduledHook, ShutdownAuthority};
use crate::audit::AuditBuffer;
use crate::lifecycle::{LifecycleHandle, LifecycleState};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Requested shutdown level, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownLevel {
    /// No shutdown
    #[default]
    Continue,
    /// Reboot the instance
    Reboot,
    /// Stop the instance
    Stop,
    /// Terminate the instance
    Terminate,
}

impl ShutdownLevel {
    /// Wire name of the level
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Reboot => "reboot",
            Self::Stop => "stop",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for ShutdownLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the decommission bundle for a scheduled shutdown level
pub type DecommissionHook = Arc<dyn Fn(ShutdownLevel) -> Bundle + Send + Sync>;

#[derive(Debug, Default, Clone, Copy)]
struct Pending {
    level: ShutdownLevel,
    immediately: bool,
}

/// The instance's pending shutdown.
///
/// Submissions only escalate: a `stop` after a `terminate` keeps
/// `terminate`, and `immediately` stays set once requested.
pub struct ShutdownRequest {
    pending: Mutex<Pending>,
    lifecycle: LifecycleHandle,
    decommission_bundle: DecommissionHook,
}

impl ShutdownRequest {
    /// No shutdown pending. `decommission_bundle` builds the bundle handed
    /// back to the queue once a shutdown is scheduled.
    pub fn new(lifecycle: LifecycleHandle, decommission_bundle: DecommissionHook) -> Self {
        Self {
            pending: Mutex::new(Pending::default()),
            lifecycle,
            decommission_bundle,
        }
    }

    /// Record a request and return the resulting level.
    pub fn submit(&self, level: ShutdownLevel, immediately: bool) -> ShutdownLevel {
        let mut pending = self.pending.lock();
        if level > pending.level {
            pending.level = level;
        }
        pending.immediately |= immediately;
        info!(
            requested = %level,
            level = %pending.level,
            immediately = pending.immediately,
            "Shutdown requested"
        );
        pending.level
    }

    /// Highest level requested so far
    pub fn level(&self) -> ShutdownLevel {
        self.pending.lock().level
    }

    /// A shutdown other than `continue` was requested
    pub fn is_pending(&self) -> bool {
        self.level() != ShutdownLevel::Continue
    }
}

#[async_trait]
impl ShutdownAuthority for ShutdownRequest {
    fn is_immediate(&self) -> bool {
        let pending = self.pending.lock();
        pending.immediately && pending.level != ShutdownLevel::Continue
    }

    async fn manage_shutdown_request(&self, audit: AuditBuffer, on_scheduled: ScheduledHook) {
        let Pending { level, immediately } = *self.pending.lock();
        if level == ShutdownLevel::Continue {
            if let Err(e) = audit.update_status("shutdown request: nothing to do", None) {
                debug!("Failed to audit shutdown request: {}", e);
            }
            on_scheduled(None);
            return;
        }

        let when = if immediately { "immediately" } else { "deferred" };
        if let Err(e) = audit.update_status(format!("Scheduling {level} ({when})"), None) {
            debug!("Failed to audit shutdown request: {}", e);
        }

        if let Err(e) = self.lifecycle.set_state(LifecycleState::Decommissioning).await {
            warn!("Failed to enter decommissioning: {}", e);
            let text = format!("Failed to enter decommissioning: {e}");
            if let Err(e) = audit.append_error(text, None) {
                debug!("Failed to audit decommissioning error: {}", e);
            }
        }
        if level == ShutdownLevel::Reboot {
            if let Err(e) = self.lifecycle.set_reboot(true).await {
                warn!("Failed to flag reboot: {}", e);
            }
        }

        info!(%level, immediately, "Shutdown scheduled, queueing decommission");
        let bundle = (self.decommission_bundle)(level);
        on_scheduled(Some(BundleContext::decommission(bundle, audit)));
    }
}
