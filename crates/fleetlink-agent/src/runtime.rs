//! # Agent Runtime
//!
//! Builds the agent's services once from an [`AgentConfig`] and wires them
//! together:
//!
//! ```text
//! bundle queue ──► converger
//!      │  └──────► shutdown request ──► lifecycle ──► coordinator
//!      ▼
//! audit buffers ──► forwarder ──► coordinator
//!                       └──► re-enroll manager
//! ```
//!
//! Every actor is spawned through one [`TaskRegistry`]. The forwarder starts
//! out buffering; call [`ForwarderHandle::init`] once the transport is ready
//! and [`AgentRuntime::activate`] to start running bundles.

use crate::audit::{AuditFactory, ForwarderAuditSink};
use crate::bundle::{
    Bundle, BundleContext, BundleQueue, BundleQueueActor, Converger, DecommissionHook,
    ShutdownLevel, ShutdownRequest,
};
use crate::config::AgentConfig;
use crate::coordinator::CoordinatorClient;
use crate::errors::{AgentError, AgentResult};
use crate::forwarder::{ForwarderActor, ForwarderHandle, ReenrollManager};
use crate::lifecycle::{HostProbe, LifecycleActor, LifecycleHandle};
use crate::task_registry::TaskRegistry;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// External collaborators the runtime depends on
pub struct Collaborators {
    /// Transport to the fleet coordinator
    pub coordinator: Arc<dyn CoordinatorClient>,
    /// Host facts for lifecycle reconciliation
    pub host: Arc<dyn HostProbe>,
    /// Applies bundles
    pub converger: Arc<dyn Converger>,
    /// Builds the bundle run once a shutdown is scheduled
    pub decommission_bundle: DecommissionHook,
    /// Run when enough re-enrollment votes accumulate
    pub on_reenroll: Arc<dyn Fn() + Send + Sync>,
}

impl Collaborators {
    /// Collaborators with an empty decommission bundle and a re-enroll
    /// action that only logs.
    pub fn new(
        coordinator: Arc<dyn CoordinatorClient>,
        host: Arc<dyn HostProbe>,
        converger: Arc<dyn Converger>,
    ) -> Self {
        Self {
            coordinator,
            host,
            converger,
            decommission_bundle: Arc::new(|_: ShutdownLevel| {
                Bundle::new("decommission", Vec::new())
            }),
            on_reenroll: Arc::new(|| warn!("Re-enrollment requested but no action configured")),
        }
    }

    /// Replace the decommission bundle builder
    pub fn with_decommission_bundle<F>(mut self, build: F) -> Self
    where
        F: Fn(ShutdownLevel) -> Bundle + Send + Sync + 'static,
    {
        self.decommission_bundle = Arc::new(build);
        self
    }

    /// Replace the action run on re-enrollment
    pub fn with_reenroll_action<F>(mut self, action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reenroll = Arc::new(action);
        self
    }
}

/// The running agent
pub struct AgentRuntime {
    tasks: TaskRegistry,
    lifecycle: LifecycleHandle,
    forwarder: ForwarderHandle,
    audits: AuditFactory,
    queue: BundleQueue,
    shutdown: Arc<ShutdownRequest>,
    reenroll: Arc<ReenrollManager>,
    completed: oneshot::Receiver<()>,
}

impl AgentRuntime {
    /// Validate the configuration and start every service.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: &AgentConfig,
        identity: &str,
        collaborators: Collaborators,
    ) -> AgentResult<Self> {
        config.validate()?;
        let tasks = TaskRegistry::new();

        let on_reenroll = collaborators.on_reenroll;
        let reenroll = Arc::new(ReenrollManager::new(&config.reenroll, move || {
            on_reenroll();
        }));

        let (forwarder, forwarder_actor) = ForwarderActor::new(
            &config.forwarder,
            collaborators.coordinator.clone(),
            reenroll.clone(),
        );
        tasks.spawn_cancellable(forwarder_actor.run());

        let audits = AuditFactory::new(
            Arc::new(ForwarderAuditSink::new(forwarder.clone())),
            &config.audit,
        );

        let (lifecycle, lifecycle_actor) = LifecycleActor::init(
            &config.lifecycle,
            identity,
            collaborators.coordinator,
            collaborators.host,
        );
        tasks.spawn_cancellable(lifecycle_actor.run());

        let (queue, inbox) = BundleQueue::channel();
        let shutdown = Arc::new(ShutdownRequest::new(
            lifecycle.clone(),
            collaborators.decommission_bundle,
        ));

        let (completed_tx, completed) = oneshot::channel();
        let queue_actor = BundleQueueActor::new(
            inbox,
            collaborators.converger,
            shutdown.clone(),
            audits.clone(),
            Box::new(move || {
                let _ = completed_tx.send(());
            }),
        );
        tasks.spawn_cancellable(queue_actor.run());

        info!(identity, tasks = tasks.len(), "Agent runtime started");
        Ok(Self {
            tasks,
            lifecycle,
            forwarder,
            audits,
            queue,
            shutdown,
            reenroll,
            completed,
        })
    }

    /// Lifecycle state machine
    pub fn lifecycle(&self) -> &LifecycleHandle {
        &self.lifecycle
    }

    /// Offline request forwarder
    pub fn forwarder(&self) -> &ForwarderHandle {
        &self.forwarder
    }

    /// Opens audits backed by the forwarder
    pub fn audits(&self) -> &AuditFactory {
        &self.audits
    }

    /// Bundle execution queue
    pub fn queue(&self) -> &BundleQueue {
        &self.queue
    }

    /// Pending shutdown
    pub fn shutdown_request(&self) -> &ShutdownRequest {
        &self.shutdown
    }

    /// Re-enrollment vote tally
    pub fn reenroll(&self) -> &ReenrollManager {
        &self.reenroll
    }

    /// Start running queued bundles
    pub fn activate(&self) -> AgentResult<()> {
        self.queue.activate()
    }

    /// Open an audit for `bundle` and queue it.
    ///
    /// Opening the audit is a coordinator request, so this waits for the
    /// forwarder to be online. Falls back to a log-only audit if the
    /// coordinator refuses.
    pub async fn run_bundle(&self, bundle: Bundle) -> AgentResult<()> {
        let summary = bundle.description();
        let audit = match self.audits.create_audit(&summary, None).await {
            Ok(audit) => audit,
            Err(e) => {
                warn!(bundle = %summary, "Failed to open audit, logging locally: {}", e);
                self.audits.detached()
            }
        };
        self.queue.push(BundleContext::new(bundle, audit))
    }

    /// Request a shutdown; it is processed after the bundles already queued.
    pub fn request_shutdown(
        &self,
        level: ShutdownLevel,
        immediately: bool,
    ) -> AgentResult<ShutdownLevel> {
        let level = self.shutdown.submit(level, immediately);
        self.queue.push_shutdown()?;
        Ok(level)
    }

    /// Let queued bundles finish, then stop every service.
    ///
    /// Activates the queue if it never was, so nothing already queued is
    /// lost.
    pub async fn shutdown(self) -> AgentResult<()> {
        let closed = self.queue.activate().and_then(|()| self.queue.close());
        let result = match closed {
            Ok(()) => self
                .completed
                .await
                .map_err(|_| AgentError::stopped("bundle queue")),
            Err(e) => Err(e),
        };
        self.tasks.shutdown();
        info!("Agent runtime stopped");
        result
    }
}
