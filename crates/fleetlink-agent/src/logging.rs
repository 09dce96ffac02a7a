//! Tracing subscriber setup.
//!
//! The persisted lifecycle state carries the operator-selected log level;
//! `RUST_LOG` still wins when present.

use crate::config::LifecycleConfig;
use crate::lifecycle::StateStore;
use tracing_subscriber::EnvFilter;

/// Default directive when neither `RUST_LOG` nor a persisted level is set
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Build the filter for a persisted log level.
pub fn env_filter(log_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = log_level.unwrap_or(DEFAULT_LOG_LEVEL);
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL))
    })
}

/// Install the global fmt subscriber.
///
/// Returns `false` if a subscriber was already installed.
pub fn init_tracing(log_level: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(log_level))
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Install the subscriber using the level persisted in the lifecycle state.
pub fn init_tracing_from_state(config: &LifecycleConfig) -> bool {
    let level = StateStore::new(&config.state_path)
        .load()
        .ok()
        .flatten()
        .and_then(|state| state.log_level);
    init_tracing(level.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_falls_back() {
        // Must not panic on garbage input
        let _ = env_filter(Some("=not a directive="));
        let _ = env_filter(None);
    }
}
