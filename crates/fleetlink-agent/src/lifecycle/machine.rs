//! # Instance Lifecycle State Machine
//!
//! Owns the instance's lifecycle value, keeps it on disk, and reports
//! recorded values to the coordinator with a bounded number of retries.
//!
//! The value lives inside a single actor task. Handles read a `watch`
//! snapshot and send commands; only the actor mutates. `record_state` calls
//! run as spawned tasks whose results come back through an internal channel,
//! so a slow coordinator never delays a transition or its observers.
//!
//! At most one report is in flight. A transition made while one is pending
//! is reported once it settles, so every report carries the state the
//! coordinator acknowledged last.
//!
//! ## Boot reconciliation
//!
//! | persisted record             | outcome                          |
//! |------------------------------|----------------------------------|
//! | none                         | first boot, `Booting`            |
//! | other identity, same resource| restart, `Booting`, history kept |
//! | other identity, new resource | re-image, `Booting`, fresh       |
//! | reboot flag or lower uptime  | reboot, `Booting`                |
//! | otherwise                    | resumed as persisted             |

use super::host::HostProbe;
use super::state::{LifecycleState, PersistedState, StateStore};
use crate::config::LifecycleConfig;
use crate::coordinator::CoordinatorClient;
use crate::errors::{AgentError, AgentResult, RecordStateError};
use crate::timer::Timer;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument, Span};

/// Callback invoked after every transition. Must not block.
pub type StateObserver = Arc<dyn Fn(LifecycleState) + Send + Sync>;

/// How the persisted record was reconciled at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootKind {
    /// No persisted record existed
    FirstBoot,
    /// Same identity, no reboot detected
    Resumed,
    /// Reboot flag set or host uptime went backwards
    Reboot,
    /// New identity on the same cloud resource
    Restart,
    /// New identity on a different cloud resource (bundled or re-imaged)
    Reimage,
}

/// Read-only view of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSnapshot {
    /// Instance identity the record belongs to
    pub identity: String,
    /// Current lifecycle value
    pub value: LifecycleState,
    /// Value last acknowledged by the coordinator
    pub last_recorded: Option<LifecycleState>,
    /// Failed reports of the current value
    pub record_retries: u32,
    /// Tags applied at startup
    pub startup_tags: Vec<String>,
    /// Persisted log filter override
    pub log_level: Option<String>,
    /// Next start counts as a reboot
    pub reboot: bool,
    /// How the record was reconciled at startup
    pub boot_kind: BootKind,
}

impl LifecycleSnapshot {
    fn from_state(state: &PersistedState, boot_kind: BootKind) -> Self {
        Self {
            identity: state.identity.clone(),
            value: state.value,
            last_recorded: state.last_recorded_value,
            record_retries: state.record_retries,
            startup_tags: state.startup_tags.clone(),
            log_level: state.log_level.clone(),
            reboot: state.reboot,
            boot_kind,
        }
    }
}

type Reply = oneshot::Sender<AgentResult<()>>;

enum Command {
    SetState { state: LifecycleState, reply: Reply },
    SetStartupTags { tags: Vec<String>, reply: Reply },
    SetLogLevel { level: Option<String>, reply: Reply },
    SetReboot { reboot: bool, reply: Reply },
    MessageReceived,
    Observe(StateObserver),
}

struct ReportOutcome {
    generation: u64,
    state: LifecycleState,
    result: Result<(), RecordStateError>,
}

/// Apply the boot reconciliation rules to a persisted record.
pub(crate) fn reconcile(
    persisted: Option<PersistedState>,
    identity: &str,
    uptime_secs: u64,
    resource_uid: Option<&str>,
) -> (PersistedState, BootKind) {
    let (mut state, kind) = match persisted {
        None => (PersistedState::fresh(identity), BootKind::FirstBoot),
        Some(old) if old.identity != identity => {
            let same_resource = matches!(
                (old.last_observed_resource_uid.as_deref(), resource_uid),
                (Some(seen), Some(current)) if seen == current
            );
            if same_resource {
                let restarted = PersistedState {
                    identity: identity.to_string(),
                    ..old
                };
                (restarted, BootKind::Restart)
            } else {
                (PersistedState::fresh(identity), BootKind::Reimage)
            }
        }
        Some(old) if old.reboot || uptime_secs < old.uptime => (old, BootKind::Reboot),
        Some(old) => (old, BootKind::Resumed),
    };

    if kind != BootKind::Resumed {
        state.value = LifecycleState::Booting;
        state.reboot = false;
        state.record_retries = 0;
    }
    state.uptime = uptime_secs;
    if let Some(uid) = resource_uid {
        state.last_observed_resource_uid = Some(uid.to_string());
    }
    (state, kind)
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Handle to the lifecycle state machine
#[derive(Clone)]
pub struct LifecycleHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<LifecycleSnapshot>,
    read_only: bool,
}

impl LifecycleHandle {
    /// Open the persisted state for inspection only.
    ///
    /// No reconciliation is applied, nothing is written or reported, and
    /// every mutating call fails with [`AgentError::ReadOnly`].
    pub fn open_read_only(config: &LifecycleConfig, identity: &str) -> Self {
        let store = StateStore::new(&config.state_path);
        let state = match store.load() {
            Ok(Some(state)) => state,
            Ok(None) => PersistedState::fresh(identity),
            Err(e) => {
                warn!(
                    path = %store.path().display(),
                    "Unreadable lifecycle state, using defaults: {}",
                    e
                );
                PersistedState::fresh(identity)
            }
        };
        let (_snapshot_tx, snapshot) =
            watch::channel(LifecycleSnapshot::from_state(&state, BootKind::Resumed));
        let (commands, _) = mpsc::unbounded_channel();
        Self {
            commands,
            snapshot,
            read_only: true,
        }
    }

    /// Opened with [`LifecycleHandle::open_read_only`]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Current lifecycle value
    pub fn value(&self) -> LifecycleState {
        self.snapshot.borrow().value
    }

    /// Value last acknowledged by the coordinator
    pub fn last_recorded(&self) -> Option<LifecycleState> {
        self.snapshot.borrow().last_recorded
    }

    /// Copy of the full published view
    pub fn snapshot(&self) -> LifecycleSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch every snapshot the actor publishes
    pub fn subscribe(&self) -> watch::Receiver<LifecycleSnapshot> {
        self.snapshot.clone()
    }

    /// Transition to `state`.
    ///
    /// Returns once the transition is persisted and observers have run; the
    /// coordinator report completes in the background.
    pub async fn set_state(&self, state: LifecycleState) -> AgentResult<()> {
        self.call(|reply| Command::SetState { state, reply }).await
    }

    /// Replace and persist the startup tags
    pub async fn set_startup_tags(&self, tags: Vec<String>) -> AgentResult<()> {
        self.call(|reply| Command::SetStartupTags { tags, reply }).await
    }

    /// Persist a log filter override for the next start
    pub async fn set_log_level(&self, level: Option<String>) -> AgentResult<()> {
        self.call(|reply| Command::SetLogLevel { level, reply }).await
    }

    /// Mark the next start as a reboot
    pub async fn set_reboot(&self, reboot: bool) -> AgentResult<()> {
        self.call(|reply| Command::SetReboot { reboot, reply }).await
    }

    /// Note contact with the coordinator. Writes are throttled.
    pub fn message_received(&self) {
        if !self.read_only {
            let _ = self.commands.send(Command::MessageReceived);
        }
    }

    /// Register a transition observer
    pub fn observe<F>(&self, observer: F) -> AgentResult<()>
    where
        F: Fn(LifecycleState) + Send + Sync + 'static,
    {
        if self.read_only {
            return Err(AgentError::ReadOnly);
        }
        self.commands
            .send(Command::Observe(Arc::new(observer)))
            .map_err(|_| AgentError::stopped("lifecycle"))
    }

    async fn call(&self, command: impl FnOnce(Reply) -> Command) -> AgentResult<()> {
        if self.read_only {
            return Err(AgentError::ReadOnly);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| AgentError::stopped("lifecycle"))?;
        response
            .await
            .map_err(|_| AgentError::stopped("lifecycle"))?
    }
}

/// Actor owning the lifecycle state
pub struct LifecycleActor {
    config: LifecycleConfig,
    store: StateStore,
    state: PersistedState,
    boot_kind: BootKind,
    coordinator: Arc<dyn CoordinatorClient>,
    host: Arc<dyn HostProbe>,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<ReportOutcome>,
    reports_rx: mpsc::UnboundedReceiver<ReportOutcome>,
    snapshot: watch::Sender<LifecycleSnapshot>,
    observers: Vec<StateObserver>,
    retry_timer: Timer,
    generation: u64,
    report_in_flight: bool,
    last_communication_write: Option<Instant>,
    span: Span,
}

impl LifecycleActor {
    /// Load, reconcile and persist the lifecycle state for `identity`.
    ///
    /// Missing or corrupt state files fall back to a fresh record. Spawn
    /// [`LifecycleActor::run`] to start reporting.
    pub fn init(
        config: &LifecycleConfig,
        identity: &str,
        coordinator: Arc<dyn CoordinatorClient>,
        host: Arc<dyn HostProbe>,
    ) -> (LifecycleHandle, LifecycleActor) {
        let store = StateStore::new(&config.state_path);
        let persisted = match store.load() {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    path = %store.path().display(),
                    "Unreadable lifecycle state, using defaults: {}",
                    e
                );
                None
            }
        };

        let resource_uid = host.resource_uid();
        let (state, boot_kind) = reconcile(
            persisted,
            identity,
            host.uptime().as_secs(),
            resource_uid.as_deref(),
        );
        info!(
            identity,
            state = %state.value,
            boot = ?boot_kind,
            "Lifecycle state initialized"
        );

        let span = tracing::info_span!("lifecycle", identity, state = state.value.as_str());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) =
            watch::channel(LifecycleSnapshot::from_state(&state, boot_kind));

        let mut actor = LifecycleActor {
            config: config.clone(),
            store,
            state,
            boot_kind,
            coordinator,
            host,
            commands,
            reports_tx,
            reports_rx,
            snapshot,
            observers: Vec::new(),
            retry_timer: Timer::idle(),
            generation: 0,
            report_in_flight: false,
            last_communication_write: None,
            span,
        };
        actor.persist();

        let handle = LifecycleHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            read_only: false,
        };
        (handle, actor)
    }

    /// Process commands and report outcomes until every handle is dropped.
    pub async fn run(mut self) {
        let span = self.span.clone();
        async move {
            if self.should_report() {
                self.send_report();
            }
            loop {
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => self.handle(command),
                        None => break,
                    },
                    Some(outcome) = self.reports_rx.recv() => self.on_report(outcome),
                    _ = self.retry_timer.fired() => {
                        debug!(attempt = self.state.record_retries + 1, "Retrying record_state");
                        self.send_report();
                    }
                }
            }
            debug!("Lifecycle service stopped");
        }
        .instrument(span)
        .await;
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::SetState { state, reply } => {
                let _ = reply.send(self.set_state(state));
            }
            Command::SetStartupTags { tags, reply } => {
                self.state.startup_tags = tags;
                self.persist();
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::SetLogLevel { level, reply } => {
                info!(level = ?level, "Log level changed");
                self.state.log_level = level;
                self.persist();
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::SetReboot { reboot, reply } => {
                self.state.reboot = reboot;
                self.persist();
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Command::MessageReceived => self.message_received(),
            Command::Observe(observer) => self.observers.push(observer),
        }
    }

    fn set_state(&mut self, new_state: LifecycleState) -> AgentResult<()> {
        if !new_state.is_settable() {
            warn!(state = %new_state, "Rejected illegal lifecycle transition");
            return Err(AgentError::IllegalState(new_state));
        }

        let previous = self.state.value;
        info!(from = %previous, to = %new_state, "Lifecycle state transition");
        self.state.value = new_state;
        self.span.record("state", new_state.as_str());

        self.state.record_retries = 0;
        self.retry_timer.cancel();
        self.generation += 1;
        self.persist();

        if self.should_report() {
            self.send_report();
        }
        self.publish();
        self.notify(new_state);
        Ok(())
    }

    /// Current value is recorded, unacknowledged, and retries remain
    fn should_report(&self) -> bool {
        self.state.value.is_recorded()
            && self.state.last_recorded_value != Some(self.state.value)
            && self.state.record_retries < self.config.max_record_retries
    }

    fn send_report(&mut self) {
        if self.report_in_flight {
            debug!(state = %self.state.value, "Report in flight, recording once it settles");
            return;
        }
        self.report_in_flight = true;
        let identity = self.state.identity.clone();
        let state = self.state.value;
        let from_state = self.state.last_recorded_value;
        let generation = self.generation;
        let coordinator = self.coordinator.clone();
        let outcomes = self.reports_tx.clone();

        debug!(%state, from = ?from_state, "Recording lifecycle state");
        tokio::spawn(async move {
            let result = coordinator.record_state(&identity, state, from_state).await;
            let _ = outcomes.send(ReportOutcome {
                generation,
                state,
                result,
            });
        });
    }

    fn on_report(&mut self, outcome: ReportOutcome) {
        self.report_in_flight = false;
        if outcome.generation != self.generation {
            self.on_superseded_report(outcome);
            return;
        }

        match outcome.result {
            Ok(()) => {
                info!(state = %outcome.state, "Lifecycle state recorded");
                self.state.last_recorded_value = Some(outcome.state);
                self.state.record_retries = 0;
            }
            Err(e) => {
                if let Some(recorded) = e.recorded_state {
                    warn!(
                        local = %self.state.value,
                        recorded = %recorded,
                        "Coordinator holds a different recorded state, adopting it"
                    );
                    self.state.last_recorded_value = Some(recorded);
                }
                self.state.record_retries += 1;

                if self.state.last_recorded_value == Some(self.state.value) {
                    self.state.record_retries = 0;
                } else if self.should_report() {
                    let delay = self.config.record_retry_delay();
                    warn!(
                        state = %self.state.value,
                        retries = self.state.record_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to record lifecycle state, will retry: {}",
                        e.message
                    );
                    self.retry_timer.arm(delay);
                } else {
                    warn!(
                        state = %self.state.value,
                        retries = self.state.record_retries,
                        "Giving up recording lifecycle state: {}",
                        e.message
                    );
                }
            }
        }
        self.persist();
        self.publish();
    }

    /// The value changed while this report was in flight. Keep what the
    /// coordinator acknowledged, then report the current value. The retry
    /// budget belongs to the current value only.
    fn on_superseded_report(&mut self, outcome: ReportOutcome) {
        let acknowledged = match &outcome.result {
            Ok(()) => Some(outcome.state),
            Err(e) => e.recorded_state,
        };
        debug!(
            state = %outcome.state,
            acknowledged = ?acknowledged,
            "record_state settled for superseded state"
        );
        if acknowledged.is_some() {
            self.state.last_recorded_value = acknowledged;
        }
        if self.should_report() {
            self.send_report();
        }
        self.persist();
        self.publish();
    }

    fn message_received(&mut self) {
        self.state.last_communication = epoch_secs();
        let interval: Duration = self.config.communication_persist_interval();
        let due = self
            .last_communication_write
            .map_or(true, |written| written.elapsed() >= interval);
        if due {
            self.last_communication_write = Some(Instant::now());
            self.persist();
        }
    }

    fn persist(&mut self) {
        self.state.uptime = self.host.uptime().as_secs();
        if let Err(e) = self.store.save(&self.state) {
            warn!(path = %self.store.path().display(), "Failed to persist lifecycle state: {}", e);
        }
    }

    fn publish(&self) {
        self.snapshot
            .send_replace(LifecycleSnapshot::from_state(&self.state, self.boot_kind));
    }

    fn notify(&self, state: LifecycleState) {
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(state))).is_err() {
                warn!(%state, "Lifecycle observer panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::testing::{MockCoordinator, StaticHostProbe};
    use parking_lot::Mutex;
    use std::path::Path;

    fn config(dir: &Path) -> LifecycleConfig {
        AgentConfig::for_testing(dir).lifecycle
    }

    fn start(
        config: &LifecycleConfig,
        identity: &str,
        coordinator: &Arc<MockCoordinator>,
        host: StaticHostProbe,
    ) -> LifecycleHandle {
        let (handle, actor) =
            LifecycleActor::init(config, identity, coordinator.clone(), Arc::new(host));
        tokio::spawn(actor.run());
        handle
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_reconcile_rules() {
        let mut old = PersistedState::fresh("i-1");
        old.value = LifecycleState::Operational;
        old.uptime = 500;
        old.startup_tags = vec!["rs_login:state=user".into()];
        old.last_recorded_value = Some(LifecycleState::Operational);
        old.last_observed_resource_uid = Some("res-1".into());

        let (state, kind) = reconcile(None, "i-1", 10, None);
        assert_eq!((state.value, kind), (LifecycleState::Booting, BootKind::FirstBoot));

        let (state, kind) = reconcile(Some(old.clone()), "i-1", 900, Some("res-1"));
        assert_eq!((state.value, kind), (LifecycleState::Operational, BootKind::Resumed));

        let (state, kind) = reconcile(Some(old.clone()), "i-1", 20, Some("res-1"));
        assert_eq!((state.value, kind), (LifecycleState::Booting, BootKind::Reboot));

        let mut flagged = old.clone();
        flagged.reboot = true;
        let (state, kind) = reconcile(Some(flagged), "i-1", 900, Some("res-1"));
        assert_eq!((state.value, kind), (LifecycleState::Booting, BootKind::Reboot));
        assert!(!state.reboot);

        let (state, kind) = reconcile(Some(old.clone()), "i-2", 900, Some("res-1"));
        assert_eq!(kind, BootKind::Restart);
        assert_eq!(state.identity, "i-2");
        assert_eq!(state.value, LifecycleState::Booting);
        assert_eq!(state.startup_tags, old.startup_tags);

        let (state, kind) = reconcile(Some(old.clone()), "i-2", 900, Some("res-9"));
        assert_eq!(kind, BootKind::Reimage);
        assert!(state.startup_tags.is_empty());
        assert_eq!(state.last_recorded_value, None);
        assert_eq!(state.last_observed_resource_uid.as_deref(), Some("res-9"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_boot_reports_booting() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config(dir.path()), "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;

        assert_eq!(lifecycle.value(), LifecycleState::Booting);
        assert_eq!(lifecycle.last_recorded(), Some(LifecycleState::Booting));
        assert_eq!(
            coordinator.record_calls(),
            vec![("i-1".to_string(), LifecycleState::Booting, None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_carries_previous_acknowledged_state() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config(dir.path()), "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;

        lifecycle.set_state(LifecycleState::Operational).await.unwrap();
        settle().await;

        let calls = coordinator.record_calls();
        assert_eq!(
            calls.last(),
            Some(&(
                "i-1".to_string(),
                LifecycleState::Operational,
                Some(LifecycleState::Booting)
            ))
        );
        assert_eq!(lifecycle.snapshot().record_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_during_slow_report_waits_for_its_ack() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.set_record_delay(Duration::from_millis(50));
        coordinator.fail_record_state_once(
            LifecycleState::Operational,
            RecordStateError::transient("connection reset"),
        );
        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;

        // Booting is still at the coordinator
        lifecycle.set_state(LifecycleState::Operational).await.unwrap();
        tokio::time::sleep(config.record_retry_delay() * 5).await;

        let booting = Some(LifecycleState::Booting);
        assert_eq!(
            coordinator.record_calls(),
            vec![
                ("i-1".to_string(), LifecycleState::Booting, None),
                ("i-1".to_string(), LifecycleState::Operational, booting),
                ("i-1".to_string(), LifecycleState::Operational, booting),
            ]
        );
        assert_eq!(lifecycle.last_recorded(), Some(LifecycleState::Operational));
        assert_eq!(lifecycle.snapshot().record_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries_until_state_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.fail_record_state(RecordStateError::transient("unreachable"));

        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        tokio::time::sleep(config.record_retry_delay() * 20).await;

        assert_eq!(coordinator.record_calls().len(), 5);
        assert_eq!(lifecycle.snapshot().record_retries, 5);
        assert_eq!(lifecycle.last_recorded(), None);

        // A new transition starts a fresh retry budget
        coordinator.succeed_record_state();
        lifecycle.set_state(LifecycleState::Operational).await.unwrap();
        settle().await;

        assert_eq!(coordinator.record_calls().len(), 6);
        assert_eq!(lifecycle.last_recorded(), Some(LifecycleState::Operational));
        assert_eq!(lifecycle.snapshot().record_retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_authoritative_recorded_state_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.fail_record_state(RecordStateError::rejected(
            LifecycleState::Booting,
            "instance is decommissioning elsewhere",
        ));
        let lifecycle = start(&config(dir.path()), "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;

        // Booting matches the coordinator's record, so no retry is scheduled
        assert_eq!(lifecycle.last_recorded(), Some(LifecycleState::Booting));
        assert_eq!(lifecycle.snapshot().record_retries, 0);
        assert_eq!(coordinator.record_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_cancels_pending_retry() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        coordinator.fail_record_state(RecordStateError::transient("timeout"));
        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;
        assert_eq!(coordinator.record_calls().len(), 1);

        lifecycle.set_state(LifecycleState::Decommissioned).await.unwrap();
        tokio::time::sleep(config.record_retry_delay() * 20).await;

        // Decommissioned is not recorded; the Booting retry was dropped
        assert_eq!(coordinator.record_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_reloads_in_a_fresh_actor() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        let tags = vec!["rs_agent:type=node".to_string(), "rs_login:state=user".to_string()];

        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        lifecycle.set_startup_tags(tags.clone()).await.unwrap();
        lifecycle.set_state(LifecycleState::Operational).await.unwrap();
        settle().await;
        assert_eq!(lifecycle.last_recorded(), Some(LifecycleState::Operational));
        drop(lifecycle);
        settle().await;

        let reloaded = start(&config, "i-1", &coordinator, StaticHostProbe::new(90));
        let snapshot = reloaded.snapshot();
        assert_eq!(snapshot.boot_kind, BootKind::Resumed);
        assert_eq!(snapshot.value, LifecycleState::Operational);
        assert_eq!(snapshot.last_recorded, Some(LifecycleState::Operational));
        assert_eq!(snapshot.startup_tags, tags);
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_state_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config(dir.path()), "i-1", &coordinator, StaticHostProbe::new(30));

        let err = lifecycle.set_state(LifecycleState::Pending).await.unwrap_err();
        assert!(matches!(err, AgentError::IllegalState(LifecycleState::Pending)));
        assert_eq!(lifecycle.value(), LifecycleState::Booting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_observers_notified_and_panics_contained() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config(dir.path()), "i-1", &coordinator, StaticHostProbe::new(30));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        lifecycle.observe(|_| panic!("observer bug")).unwrap();
        lifecycle.observe(move |state| sink.lock().push(state)).unwrap();

        lifecycle.set_state(LifecycleState::Operational).await.unwrap();
        lifecycle.set_state(LifecycleState::Decommissioning).await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![LifecycleState::Operational, LifecycleState::Decommissioning]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_corrupt_state_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::write(&config.state_path, b"\x00garbage").unwrap();
        let coordinator = Arc::new(MockCoordinator::new());

        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        assert_eq!(lifecycle.snapshot().boot_kind, BootKind::FirstBoot);
        assert_eq!(lifecycle.value(), LifecycleState::Booting);

        // The rewritten file is valid again
        let stored = StateStore::new(&config.state_path).load().unwrap().unwrap();
        assert_eq!(stored.identity, "i-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_only_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        lifecycle.set_state(LifecycleState::Operational).await.unwrap();

        let reader = LifecycleHandle::open_read_only(&config, "i-1");
        assert!(reader.is_read_only());
        assert_eq!(reader.value(), LifecycleState::Operational);
        assert!(matches!(
            reader.set_state(LifecycleState::Stranded).await,
            Err(AgentError::ReadOnly)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_communication_writes_are_throttled() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let coordinator = Arc::new(MockCoordinator::new());
        let lifecycle = start(&config, "i-1", &coordinator, StaticHostProbe::new(30));
        settle().await;

        lifecycle.message_received();
        settle().await;
        let first = StateStore::new(&config.state_path).load().unwrap().unwrap();
        assert!(first.last_communication > 0);

        // Within the interval the timestamp is kept in memory only
        std::fs::remove_file(&config.state_path).unwrap();
        lifecycle.message_received();
        settle().await;
        assert!(StateStore::new(&config.state_path).load().unwrap().is_none());

        tokio::time::sleep(config.communication_persist_interval()).await;
        lifecycle.message_received();
        settle().await;
        assert!(StateStore::new(&config.state_path).load().unwrap().is_some());
    }
}
