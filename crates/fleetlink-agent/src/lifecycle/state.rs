//! Lifecycle values and their on-disk record.

use crate::errors::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Lifecycle of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Launched, not yet booting
    Pending,
    /// Running boot bundles
    Booting,
    /// Boot completed successfully
    Operational,
    /// Running the decommission bundle
    Decommissioning,
    /// Decommission finished, waiting for termination
    Decommissioned,
    /// Boot failed; the instance needs operator attention
    Stranded,
}

impl LifecycleState {
    /// All values, in lifecycle order
    pub const ALL: [LifecycleState; 6] = [
        LifecycleState::Pending,
        LifecycleState::Booting,
        LifecycleState::Operational,
        LifecycleState::Decommissioning,
        LifecycleState::Decommissioned,
        LifecycleState::Stranded,
    ];

    /// Values that must be acknowledged by the coordinator
    pub fn is_recorded(self) -> bool {
        matches!(
            self,
            LifecycleState::Booting
                | LifecycleState::Operational
                | LifecycleState::Decommissioning
                | LifecycleState::Stranded
        )
    }

    /// Values `set_state` accepts. `Pending` only ever comes from defaults.
    pub fn is_settable(self) -> bool {
        !matches!(self, LifecycleState::Pending)
    }

    /// Wire and on-disk name
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Booting => "booting",
            LifecycleState::Operational => "operational",
            LifecycleState::Decommissioning => "decommissioning",
            LifecycleState::Decommissioned => "decommissioned",
            LifecycleState::Stranded => "stranded",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| AgentError::UnknownState(s.to_string()))
    }
}

/// On-disk lifecycle record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Current lifecycle value
    pub value: LifecycleState,
    /// Instance identity the record belongs to
    pub identity: String,
    /// Host uptime in seconds at the last write
    pub uptime: u64,
    /// Set when a reboot was requested; forces `Booting` on the next start
    pub reboot: bool,
    /// Tags applied at startup
    pub startup_tags: Vec<String>,
    /// Log filter override applied at the next start
    pub log_level: Option<String>,
    /// Failed reports of `value`
    pub record_retries: u32,
    /// Value the coordinator acknowledged last
    pub last_recorded_value: Option<LifecycleState>,
    /// Last coordinator contact, whole epoch seconds
    pub last_communication: u64,
    /// Cloud instance fingerprint; tells a restart from a re-image
    pub last_observed_resource_uid: Option<String>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            value: LifecycleState::Pending,
            identity: String::new(),
            uptime: 0,
            reboot: false,
            startup_tags: Vec::new(),
            log_level: None,
            record_retries: 0,
            last_recorded_value: None,
            last_communication: 0,
            last_observed_resource_uid: None,
        }
    }
}

impl PersistedState {
    /// Fresh record for a newly seen identity
    pub fn fresh(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..Self::default()
        }
    }
}

/// JSON file holding the persisted record.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store at `path`. Nothing is read until [`StateStore::load`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the state file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. `Ok(None)` when no file exists yet.
    pub fn load(&self) -> AgentResult<Option<PersistedState>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite the record through a temporary file so readers never see a
    /// partial write.
    pub fn save(&self, state: &PersistedState) -> AgentResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
