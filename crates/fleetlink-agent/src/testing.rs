//! In-memory collaborators for tests.
//!
//! Compiled for unit tests and behind the `testing` feature, which the
//! integration tests under `tests/` enable.

use crate::audit::{AuditBuffer, AuditEntry, AuditId, AuditSink, EventCategory};
use crate::bundle::{
    Bundle, BundleContext, ConvergeOutcome, Converger, ScheduledHook, ShutdownAuthority,
};
use crate::coordinator::{CoordinatorClient, RequestOptions};
use crate::errors::{RecordStateError, TransportError};
use crate::forwarder::ReenrollVoter;
use crate::lifecycle::{HostProbe, LifecycleState};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

type PushHook = Box<dyn Fn(&Value) + Send + Sync>;
type RecordCall = (String, LifecycleState, Option<LifecycleState>);

/// Coordinator that records every call.
///
/// Requests echo their payload unless a canned response was registered for
/// the target.
#[derive(Default)]
pub struct MockCoordinator {
    record_failure: Mutex<Option<RecordStateError>>,
    record_failures_once: Mutex<Vec<(LifecycleState, RecordStateError)>>,
    record_delay: Mutex<Option<Duration>>,
    record_calls: Mutex<Vec<RecordCall>>,
    delivered: Mutex<Vec<(String, Value)>>,
    responses: Mutex<HashMap<String, Value>>,
    unreachable: AtomicBool,
    push_hook: Mutex<Option<PushHook>>,
}

impl MockCoordinator {
    /// Coordinator that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `record_state` call with `error` until reset
    pub fn fail_record_state(&self, error: RecordStateError) {
        *self.record_failure.lock() = Some(error);
    }

    /// Undo [`MockCoordinator::fail_record_state`]
    pub fn succeed_record_state(&self) {
        *self.record_failure.lock() = None;
    }

    /// Fail the next `record_state` call for `state` only
    pub fn fail_record_state_once(&self, state: LifecycleState, error: RecordStateError) {
        self.record_failures_once.lock().push((state, error));
    }

    /// Make every `record_state` call take `delay` before answering
    pub fn set_record_delay(&self, delay: Duration) {
        *self.record_delay.lock() = Some(delay);
    }

    /// `record_state` calls in the order they were made
    pub fn record_calls(&self) -> Vec<RecordCall> {
        self.record_calls.lock().clone()
    }

    /// Reject requests and pushes as unreachable
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Answer requests to `target` with `response`
    pub fn respond_with(&self, target: &str, response: Value) {
        self.responses.lock().insert(target.to_string(), response);
    }

    /// Run `hook` after each delivered push
    pub fn on_push<F>(&self, hook: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        *self.push_hook.lock() = Some(Box::new(hook));
    }

    /// Remove the hook set by [`MockCoordinator::on_push`]
    pub fn clear_push_hook(&self) {
        *self.push_hook.lock() = None;
    }

    /// Targets of delivered requests and pushes, in delivery order
    pub fn delivered_targets(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|(t, _)| t.clone()).collect()
    }

    /// Payloads of delivered requests and pushes, in delivery order
    pub fn delivered_payloads(&self) -> Vec<Value> {
        self.delivered.lock().iter().map(|(_, p)| p.clone()).collect()
    }

    /// Payloads delivered to `target`
    pub fn delivered_to(&self, target: &str) -> Vec<Value> {
        self.delivered
            .lock()
            .iter()
            .filter(|(t, _)| t == target)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn deliver(&self, target: &str, payload: &Value) -> Result<(), TransportError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(target.to_string()));
        }
        self.delivered
            .lock()
            .push((target.to_string(), payload.clone()));
        Ok(())
    }
}

#[async_trait]
impl CoordinatorClient for MockCoordinator {
    async fn record_state(
        &self,
        identity: &str,
        state: LifecycleState,
        from_state: Option<LifecycleState>,
    ) -> Result<(), RecordStateError> {
        self.record_calls
            .lock()
            .push((identity.to_string(), state, from_state));
        let delay = *self.record_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = {
            let mut once = self.record_failures_once.lock();
            let index = once.iter().position(|(failing, _)| *failing == state);
            index.map(|index| once.remove(index).1)
        };
        if let Some(error) = scripted {
            return Err(error);
        }
        match self.record_failure.lock().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn request(
        &self,
        target: &str,
        payload: Value,
        _opts: &RequestOptions,
    ) -> Result<Value, TransportError> {
        self.deliver(target, &payload)?;
        let canned = self.responses.lock().get(target).cloned();
        Ok(canned.unwrap_or(payload))
    }

    async fn push(
        &self,
        target: &str,
        payload: Value,
        _opts: &RequestOptions,
    ) -> Result<(), TransportError> {
        self.deliver(target, &payload)?;
        if let Some(hook) = self.push_hook.lock().as_ref() {
            hook(&payload);
        }
        Ok(())
    }
}

/// Host with fixed uptime and fingerprint
#[derive(Debug, Clone)]
pub struct StaticHostProbe {
    uptime: Duration,
    resource_uid: Option<String>,
}

impl StaticHostProbe {
    /// Host up for `uptime_secs`, without a resource fingerprint
    pub fn new(uptime_secs: u64) -> Self {
        Self {
            uptime: Duration::from_secs(uptime_secs),
            resource_uid: None,
        }
    }

    /// Report `uid` as the cloud resource fingerprint
    pub fn with_resource_uid(mut self, uid: &str) -> Self {
        self.resource_uid = Some(uid.to_string());
        self
    }
}

impl HostProbe for StaticHostProbe {
    fn uptime(&self) -> Duration {
        self.uptime
    }

    fn resource_uid(&self) -> Option<String> {
        self.resource_uid.clone()
    }
}

/// Re-enrollment voter that only counts
#[derive(Debug, Default)]
pub struct CountingVoter {
    votes: AtomicU64,
}

impl CountingVoter {
    /// Votes cast so far
    pub fn votes(&self) -> u64 {
        self.votes.load(Ordering::SeqCst)
    }
}

impl ReenrollVoter for CountingVoter {
    fn vote(&self) {
        self.votes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Audit sink keeping everything in memory. Audit ids start at 1.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    next_id: AtomicU64,
    fail_create: AtomicBool,
    created: Mutex<Vec<(String, EventCategory)>>,
    entries: Mutex<Vec<AuditEntry>>,
}

impl RecordingAuditSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject audit creation as unreachable
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Summaries and categories of created audits
    pub fn created(&self) -> Vec<(String, EventCategory)> {
        self.created.lock().clone()
    }

    /// Every entry sent, in order
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn create_entry(
        &self,
        summary: &str,
        category: EventCategory,
    ) -> Result<AuditId, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("auditor".into()));
        }
        self.created.lock().push((summary.to_string(), category));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn update_entry(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}

/// Converger that records bundle names and fails or panics on request
#[derive(Debug, Default)]
pub struct RecordingConverger {
    delay: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<String>>,
    panicking: Mutex<HashSet<String>>,
    started: Mutex<Vec<String>>,
    converged: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
}

impl RecordingConverger {
    /// Converger where every bundle succeeds at once
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every converge take `delay`
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Report bundle `name` as failed
    pub fn fail(&self, name: &str) {
        self.failing.lock().insert(name.to_string());
    }

    /// Panic while converging bundle `name`
    pub fn panic_on(&self, name: &str) {
        self.panicking.lock().insert(name.to_string());
    }

    /// Bundles whose converge began, in start order
    pub fn started(&self) -> Vec<String> {
        self.started.lock().clone()
    }

    /// Bundles whose converge finished, in completion order
    pub fn converged(&self) -> Vec<String> {
        self.converged.lock().clone()
    }

    /// Most converges ever running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converger for RecordingConverger {
    async fn converge(&self, context: &BundleContext) -> ConvergeOutcome {
        let name = context.bundle.name.clone();
        self.started.lock().push(name.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(running, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.lock().contains(&name) {
            panic!("converge of {name} panicked");
        }
        self.converged.lock().push(name.clone());
        if self.failing.lock().contains(&name) {
            ConvergeOutcome::failure()
        } else {
            ConvergeOutcome::success()
        }
    }
}

/// Shutdown authority with a switchable immediate flag.
///
/// Schedules every request as soon as it is handed over, handing back the
/// configured decommission bundle if any.
#[derive(Debug, Default)]
pub struct ScriptedAuthority {
    immediate: AtomicBool,
    panicking: AtomicBool,
    managed: AtomicUsize,
    decommission: Mutex<Option<Bundle>>,
}

impl ScriptedAuthority {
    /// Deferred authority with no decommission bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch immediate shutdown on or off
    pub fn set_immediate(&self, immediate: bool) {
        self.immediate.store(immediate, Ordering::SeqCst);
    }

    /// Hand `bundle` back as the decommission bundle of the next request
    pub fn decommission_with(&self, bundle: Bundle) {
        *self.decommission.lock() = Some(bundle);
    }

    /// Panic instead of scheduling
    pub fn panic_on_manage(&self) {
        self.panicking.store(true, Ordering::SeqCst);
    }

    /// Shutdown requests handed over so far
    pub fn managed(&self) -> usize {
        self.managed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShutdownAuthority for ScriptedAuthority {
    fn is_immediate(&self) -> bool {
        self.immediate.load(Ordering::SeqCst)
    }

    async fn manage_shutdown_request(&self, audit: AuditBuffer, on_scheduled: ScheduledHook) {
        self.managed.fetch_add(1, Ordering::SeqCst);
        if self.panicking.load(Ordering::SeqCst) {
            panic!("shutdown authority failed");
        }
        if let Err(e) = audit.update_status("shutdown scheduled", None) {
            debug!("Failed to audit scheduled shutdown: {}", e);
        }
        let bundle = self.decommission.lock().take();
        on_scheduled(bundle.map(|bundle| BundleContext::decommission(bundle, audit)));
    }
}
