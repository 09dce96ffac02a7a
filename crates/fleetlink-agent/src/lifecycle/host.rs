//! Host facts used to reconcile persisted state at boot.

use std::time::Duration;

/// Source of host uptime and the cloud instance fingerprint
pub trait HostProbe: Send + Sync {
    /// Time since the host booted
    fn uptime(&self) -> Duration;

    /// Fingerprint of the underlying cloud resource, if metadata is available
    fn resource_uid(&self) -> Option<String>;
}

/// Probe backed by `/proc/uptime` and a fingerprint fetched at startup.
#[derive(Debug, Clone, Default)]
pub struct SystemHostProbe {
    resource_uid: Option<String>,
}

impl SystemHostProbe {
    /// Probe reporting `resource_uid` as the fingerprint
    pub fn new(resource_uid: Option<String>) -> Self {
        Self { resource_uid }
    }
}

impl HostProbe for SystemHostProbe {
    fn uptime(&self) -> Duration {
        match std::fs::read_to_string("/proc/uptime") {
            Ok(text) => parse_proc_uptime(&text).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("Host uptime unavailable: {}", e);
                Duration::ZERO
            }
        }
    }

    fn resource_uid(&self) -> Option<String> {
        self.resource_uid.clone()
    }
}

fn parse_proc_uptime(text: &str) -> Option<Duration> {
    let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
    Duration::try_from_secs_f64(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_uptime() {
        assert_eq!(
            parse_proc_uptime("350735.47 234388.90\n"),
            Some(Duration::from_secs_f64(350735.47))
        );
        assert_eq!(parse_proc_uptime(""), None);
        assert_eq!(parse_proc_uptime("abc 1"), None);
    }
}
