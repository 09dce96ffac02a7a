//! Agent Configuration
//!
//! Configuration for the lifecycle state machine, the offline forwarder,
//! audit buffering and re-enrollment escalation. Durations are stored as
//! plain integers so the TOML file stays readable.

use crate::errors::{AgentError, AgentResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolve the default state directory for the agent.
///
/// Priority:
/// 1. `$FLEETLINK_PATH/.fleetlink` if FLEETLINK_PATH is set
/// 2. `~/.fleetlink` (home directory)
/// 3. `./.fleetlink` (current directory fallback)
pub fn default_state_dir() -> PathBuf {
    std::env::var("FLEETLINK_PATH")
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fleetlink")
}

/// Agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Lifecycle state machine configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Offline request forwarder configuration
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Audit buffering configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Re-enrollment vote configuration
    #[serde(default)]
    pub reenroll: ReenrollConfig,
}

/// Lifecycle state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Location of the persisted state file
    pub state_path: PathBuf,

    /// Maximum `record_state` attempts before giving up on a value
    pub max_record_retries: u32,

    /// Fixed delay between `record_state` attempts in milliseconds
    pub record_retry_delay_ms: u64,

    /// Minimum interval between timestamp-only state file rewrites
    pub communication_persist_interval_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_dir().join("state.json"),
            max_record_retries: 5,
            record_retry_delay_ms: 5_000,
            communication_persist_interval_secs: 60,
        }
    }
}

impl LifecycleConfig {
    /// Delay between record attempts
    pub fn record_retry_delay(&self) -> Duration {
        Duration::from_millis(self.record_retry_delay_ms)
    }

    /// Minimum interval between communication-only writes
    pub fn communication_persist_interval(&self) -> Duration {
        Duration::from_secs(self.communication_persist_interval_secs)
    }
}

/// Offline request forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Queued operations that trigger an immediate re-enrollment vote
    pub max_queued_requests: usize,

    /// Upper bound of the random delay before draining after reconnect
    pub max_flush_jitter_ms: u64,

    /// Interval between re-enrollment votes while offline
    pub reenroll_vote_interval_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_queued_requests: 1_000,
            max_flush_jitter_ms: 120_000,
            reenroll_vote_interval_ms: 15 * 60 * 1_000,
        }
    }
}

impl ForwarderConfig {
    /// Upper bound of the drain jitter
    pub fn max_flush_jitter(&self) -> Duration {
        Duration::from_millis(self.max_flush_jitter_ms)
    }

    /// Interval of the offline vote timer
    pub fn reenroll_vote_interval(&self) -> Duration {
        Duration::from_millis(self.reenroll_vote_interval_ms)
    }
}

/// Audit buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Buffered output size that forces a flush
    pub max_buffer_bytes: usize,

    /// Delay after the last append before buffered output is flushed
    pub flush_delay_ms: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 5 * 1024,
            flush_delay_ms: 2_000,
        }
    }
}

impl AuditConfig {
    /// Flush timer delay
    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }
}

/// Re-enrollment vote configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReenrollConfig {
    /// Votes needed within one window before re-enrolling
    pub vote_threshold: u32,

    /// Window after which the tally resets
    pub vote_window_secs: u64,
}

impl Default for ReenrollConfig {
    fn default() -> Self {
        Self {
            vote_threshold: 3,
            vote_window_secs: 60 * 60,
        }
    }
}

impl ReenrollConfig {
    /// Tally window
    pub fn vote_window(&self) -> Duration {
        Duration::from_secs(self.vote_window_secs)
    }
}

impl AgentConfig {
    /// Create config for testing (short intervals, state under `dir`)
    pub fn for_testing(dir: &Path) -> Self {
        Self {
            lifecycle: LifecycleConfig {
                state_path: dir.join("state.json"),
                max_record_retries: 5,
                record_retry_delay_ms: 100,
                communication_persist_interval_secs: 1,
            },
            forwarder: ForwarderConfig {
                max_queued_requests: 10,
                max_flush_jitter_ms: 50,
                reenroll_vote_interval_ms: 1_000,
            },
            audit: AuditConfig {
                max_buffer_bytes: 64,
                flush_delay_ms: 20,
            },
            reenroll: ReenrollConfig {
                vote_threshold: 2,
                vote_window_secs: 60,
            },
        }
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> AgentResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| AgentError::config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> AgentResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Reject values that would disable a bound
    pub fn validate(&self) -> AgentResult<()> {
        if self.lifecycle.max_record_retries == 0 {
            return Err(AgentError::config("lifecycle.max_record_retries must be positive"));
        }
        if self.forwarder.max_queued_requests == 0 {
            return Err(AgentError::config("forwarder.max_queued_requests must be positive"));
        }
        if self.forwarder.reenroll_vote_interval_ms == 0 {
            return Err(AgentError::config(
                "forwarder.reenroll_vote_interval_ms must be positive",
            ));
        }
        if self.audit.max_buffer_bytes == 0 {
            return Err(AgentError::config("audit.max_buffer_bytes must be positive"));
        }
        if self.reenroll.vote_threshold == 0 {
            return Err(AgentError::config("reenroll.vote_threshold must be positive"));
        }
        Ok(())
    }
}
