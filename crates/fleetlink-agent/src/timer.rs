//! Single reusable timer owned by a service actor.
//!
//! Arming an armed timer moves its deadline instead of creating a second
//! one, and cancelling drops it, so an actor can never see a superseded
//! timer fire.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Instant, Sleep};

#[derive(Debug, Default)]
pub(crate) struct Timer {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Timer {
    pub(crate) fn idle() -> Self {
        Self { sleep: None }
    }

    pub(crate) fn arm(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().reset(deadline),
            None => self.sleep = Some(Box::pin(sleep(delay))),
        }
    }

    /// Arm only if not already running.
    pub(crate) fn arm_if_idle(&mut self, delay: Duration) {
        if self.sleep.is_none() {
            self.arm(delay);
        }
    }

    pub(crate) fn cancel(&mut self) {
        self.sleep = None;
    }

    pub(crate) fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Resolves when the armed deadline passes; never resolves while idle.
    /// The timer is idle again afterwards.
    pub(crate) async fn fired(&mut self) {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
            }
            None => pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rearm_moves_deadline() {
        let start = Instant::now();
        let mut timer = Timer::idle();
        timer.arm(Duration::from_secs(2));
        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.arm(Duration::from_secs(2));

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(start.elapsed() < Duration::from_secs(4));
        assert!(!timer.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let mut timer = Timer::idle();
        timer.arm(Duration::from_millis(10));
        timer.cancel();

        let fired = tokio::time::timeout(Duration::from_secs(1), timer.fired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_if_idle_keeps_deadline() {
        let start = Instant::now();
        let mut timer = Timer::idle();
        timer.arm_if_idle(Duration::from_secs(1));
        timer.arm_if_idle(Duration::from_secs(5));

        timer.fired().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
