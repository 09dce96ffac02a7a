//! Re-enrollment escalation.
//!
//! Votes come from sustained outages and queue overflow. A single vote is a
//! hint; the instance only re-enrolls once enough votes land inside one
//! window.

use crate::config::ReenrollConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Receiver of re-enrollment votes
pub trait ReenrollVoter: Send + Sync {
    /// Count one vote to re-enroll. Must not block.
    fn vote(&self);
}

#[derive(Debug, Default)]
struct Tally {
    votes: u32,
    window_start: Option<Instant>,
}

/// Tallies votes and runs the re-enroll action at the threshold.
pub struct ReenrollManager {
    threshold: u32,
    window: Duration,
    tally: Mutex<Tally>,
    on_reenroll: Box<dyn Fn() + Send + Sync>,
}

impl ReenrollManager {
    /// Manager running `on_reenroll` once the configured threshold is met
    pub fn new<F>(config: &ReenrollConfig, on_reenroll: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            threshold: config.vote_threshold,
            window: config.vote_window(),
            tally: Mutex::new(Tally::default()),
            on_reenroll: Box::new(on_reenroll),
        }
    }

    /// Votes counted in the current window
    pub fn votes(&self) -> u32 {
        self.tally.lock().votes
    }
}

impl ReenrollVoter for ReenrollManager {
    fn vote(&self) {
        let now = Instant::now();
        let reenroll = {
            let mut tally = self.tally.lock();
            let expired = tally
                .window_start
                .map_or(true, |start| now.duration_since(start) >= self.window);
            if expired {
                tally.votes = 0;
                tally.window_start = Some(now);
            }
            tally.votes += 1;
            info!(votes = tally.votes, threshold = self.threshold, "Re-enrollment vote cast");

            if tally.votes >= self.threshold {
                *tally = Tally::default();
                true
            } else {
                false
            }
        };

        if reenroll {
            warn!("Re-enrollment vote threshold reached, re-enrolling");
            (self.on_reenroll)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn manager(threshold: u32, window_secs: u64) -> (ReenrollManager, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let config = ReenrollConfig {
            vote_threshold: threshold,
            vote_window_secs: window_secs,
        };
        let manager = ReenrollManager::new(&config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (manager, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_threshold_triggers_once_and_resets() {
        let (manager, fired) = manager(3, 60);

        manager.vote();
        manager.vote();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        manager.vote();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.votes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_votes_expire_with_window() {
        let (manager, fired) = manager(2, 60);

        manager.vote();
        tokio::time::sleep(Duration::from_secs(61)).await;
        manager.vote();

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(manager.votes(), 1);
    }
}
