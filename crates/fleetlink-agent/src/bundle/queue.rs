//! # Bundle Execution Queue
//!
//! Runs bundles strictly one at a time in the order they were pushed.
//!
//! Two sentinels travel through the same FIFO as bundles:
//!
//! - **shutdown**: opens an audit for the request and hands it to the
//!   [`ShutdownAuthority`]. The queue pauses until the authority reports the
//!   shutdown as scheduled. The decommission bundle it hands back runs
//!   next, ahead of anything still queued, including a final sentinel. If
//!   the authority returns or panics without scheduling, the queue resumes.
//! - **final**: deactivates the queue and fires the completion continuation.
//!
//! While the authority reports an immediate shutdown, ordinary bundles are
//! skipped and audited as such; decommission bundles still run.
//!
//! A failed or panicking converge is audited and the queue moves on.

use super::context::{BundleContext, ConvergeOutcome, Converger, ShutdownAuthority};
use crate::audit::AuditFactory;
use crate::errors::{AgentError, AgentResult};
use futures::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Continuation fired once the final sentinel is consumed
pub type CompletionHook = Box<dyn FnOnce() + Send>;

enum Item {
    Bundle(BundleContext),
    Shutdown,
    Final,
}

enum Command {
    Push(Item),
    Activate,
    Clear,
}

enum Event {
    Converged {
        context: BundleContext,
        outcome: ConvergeOutcome,
    },
    ShutdownScheduled(Option<BundleContext>),
    /// The authority call returned or panicked
    ShutdownSettled,
}

/// Observable queue state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    /// Consuming items
    pub active: bool,
    /// A bundle or shutdown request is in flight
    pub busy: bool,
    /// Items waiting, sentinels included
    pub pending: usize,
    /// Bundles that ran to an outcome
    pub completed: u64,
    /// Bundles skipped by an immediate shutdown
    pub skipped: u64,
}

/// Receiving side of a queue created with [`BundleQueue::channel`]
pub struct BundleQueueInbox {
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<QueueStatus>,
}

/// Handle to the bundle queue
#[derive(Clone)]
pub struct BundleQueue {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<QueueStatus>,
}

impl BundleQueue {
    /// Create a handle before the actor exists.
    ///
    /// Collaborators such as the shutdown request need to enqueue bundles
    /// themselves, so they receive the handle first.
    pub fn channel() -> (BundleQueue, BundleQueueInbox) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(QueueStatus::default());
        (
            BundleQueue {
                commands: commands_tx,
                status,
            },
            BundleQueueInbox {
                commands,
                status: status_tx,
            },
        )
    }

    /// Queue a bundle
    pub fn push(&self, context: BundleContext) -> AgentResult<()> {
        self.send(Command::Push(Item::Bundle(context)))
    }

    /// Queue a shutdown request behind everything already pushed
    pub fn push_shutdown(&self) -> AgentResult<()> {
        self.send(Command::Push(Item::Shutdown))
    }

    /// Start consuming. Idempotent.
    pub fn activate(&self) -> AgentResult<()> {
        self.send(Command::Activate)
    }

    /// Drop bundles that have not started
    pub fn clear(&self) -> AgentResult<()> {
        self.send(Command::Clear)
    }

    /// Finish once everything already pushed has run
    pub fn close(&self) -> AgentResult<()> {
        self.send(Command::Push(Item::Final))
    }

    /// Current status
    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.clone()
    }

    fn send(&self, command: Command) -> AgentResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AgentError::stopped("bundle queue"))
    }
}

/// Single consumer of the bundle queue
pub struct BundleQueueActor {
    commands: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<QueueStatus>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    converger: Arc<dyn Converger>,
    authority: Arc<dyn ShutdownAuthority>,
    audits: AuditFactory,
    on_complete: Option<CompletionHook>,
    queue: VecDeque<Item>,
    shutdown_in_progress: bool,
    /// Paused until the authority schedules the shutdown
    awaiting_schedule: bool,
    status: QueueStatus,
}

impl BundleQueueActor {
    /// Inactive consumer for `inbox`; `on_complete` fires at the final
    /// sentinel.
    pub fn new(
        inbox: BundleQueueInbox,
        converger: Arc<dyn Converger>,
        authority: Arc<dyn ShutdownAuthority>,
        audits: AuditFactory,
        on_complete: CompletionHook,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            commands: inbox.commands,
            status_tx: inbox.status,
            events_tx,
            events,
            converger,
            authority,
            audits,
            on_complete: Some(on_complete),
            queue: VecDeque::new(),
            shutdown_in_progress: false,
            awaiting_schedule: false,
            status: QueueStatus::default(),
        }
    }

    /// Consume until every handle is dropped and nothing is in flight.
    pub async fn run(mut self) {
        let mut accepting = true;
        while accepting || self.status.busy {
            tokio::select! {
                command = self.commands.recv(), if accepting => match command {
                    Some(command) => self.handle(command),
                    None => accepting = false,
                },
                Some(event) = self.events.recv() => self.on_event(event),
            }
            self.pump();
            self.publish();
        }
        debug!(dropped = self.queue.len(), "Bundle queue stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Push(item) => self.queue.push_back(item),
            Command::Activate => {
                if !self.status.active {
                    info!(pending = self.queue.len(), "Bundle queue activated");
                    self.status.active = true;
                }
            }
            Command::Clear => {
                let before = self.queue.len();
                self.queue.retain(|item| !matches!(item, Item::Bundle(_)));
                info!(discarded = before - self.queue.len(), "Cleared bundle queue");
            }
        }
    }

    fn pump(&mut self) {
        while self.status.active && !self.status.busy {
            let Some(item) = self.queue.pop_front() else {
                break;
            };
            match item {
                Item::Final => self.finish(),
                Item::Shutdown => self.begin_shutdown(),
                Item::Bundle(context) => {
                    if !context.decommission && self.authority.is_immediate() {
                        self.skip(context);
                    } else {
                        self.start(context);
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        info!(completed = self.status.completed, "Bundle queue finished");
        self.status.active = false;
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutdown_in_progress {
            debug!("Shutdown already in progress, ignoring request");
            return;
        }
        info!("Processing shutdown request");
        self.shutdown_in_progress = true;
        self.awaiting_schedule = true;
        self.status.busy = true;

        let audits = self.audits.clone();
        let authority = self.authority.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let audit = match audits.create_audit("Shutdown requested", None).await {
                Ok(audit) => audit,
                Err(e) => {
                    warn!("Failed to open shutdown audit, logging locally: {}", e);
                    audits.detached()
                }
            };
            let scheduled = events.clone();
            let on_scheduled = Box::new(move |context: Option<BundleContext>| {
                let _ = scheduled.send(Event::ShutdownScheduled(context));
            });
            let managed = AssertUnwindSafe(authority.manage_shutdown_request(audit, on_scheduled))
                .catch_unwind()
                .await;
            if managed.is_err() {
                error!("Shutdown handling panicked");
            }
            let _ = events.send(Event::ShutdownSettled);
        });
    }

    fn skip(&mut self, context: BundleContext) {
        let description = context.description();
        info!(bundle = %description, "Skipping bundle due to immediate shutdown");
        if let Err(e) = context.audit.update_status(
            format!("skipped due to immediate shutdown: {description}"),
            None,
        ) {
            debug!("Failed to audit skipped bundle: {}", e);
        }
        self.status.skipped += 1;
    }

    fn start(&mut self, context: BundleContext) {
        info!(
            bundle = %context.description(),
            decommission = context.decommission,
            "Running bundle"
        );
        self.status.busy = true;

        let converger = self.converger.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(converger.converge(&context)).catch_unwind();
            let outcome = match run.await {
                Ok(outcome) => outcome,
                Err(_) => {
                    error!(bundle = %context.description(), "Converge panicked");
                    ConvergeOutcome::failure()
                }
            };
            let _ = events.send(Event::Converged { context, outcome });
        });
    }

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Converged {
                mut context,
                outcome,
            } => {
                context.succeeded = outcome.succeeded;
                self.complete(&context);
                self.status.completed += 1;
                self.status.busy = false;
            }
            Event::ShutdownScheduled(context) => {
                if let Some(context) = context {
                    debug!(bundle = %context.description(), "Decommission bundle runs next");
                    self.queue.push_front(Item::Bundle(context));
                }
                if self.awaiting_schedule {
                    debug!("Shutdown scheduled, resuming bundle queue");
                    self.resume_after_shutdown();
                }
            }
            Event::ShutdownSettled => {
                if self.awaiting_schedule {
                    warn!("Shutdown was never scheduled, resuming bundle queue");
                    self.resume_after_shutdown();
                }
            }
        }
    }

    fn resume_after_shutdown(&mut self) {
        self.awaiting_schedule = false;
        self.status.busy = false;
    }

    fn complete(&self, context: &BundleContext) {
        let description = context.description();
        let outcome = if context.succeeded { "completed" } else { "failed" };
        let status = if context.decommission {
            format!("decommission {outcome}: {description}")
        } else {
            format!("{outcome}: {description}")
        };
        let category = (!context.succeeded).then_some("error");

        if context.succeeded {
            info!(bundle = %description, "{}", status);
        } else {
            warn!(bundle = %description, "{}", status);
        }
        if let Err(e) = context.audit.update_status(status, category) {
            debug!("Failed to audit bundle outcome: {}", e);
        }
    }

    fn publish(&mut self) {
        self.status.pending = self.queue.len();
        self.status_tx.send_replace(self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditBuffer, AuditEntryKind};
    use crate::bundle::Bundle;
    use crate::config::{AgentConfig, AuditConfig};
    use crate::testing::{RecordingAuditSink, RecordingConverger, ScriptedAuthority};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Fixture {
        queue: BundleQueue,
        converger: Arc<RecordingConverger>,
        authority: Arc<ScriptedAuthority>,
        sink: Arc<RecordingAuditSink>,
        completions: Arc<AtomicUsize>,
        config: AuditConfig,
    }

    impl Fixture {
        fn start() -> Self {
            let config = AgentConfig::for_testing(std::path::Path::new("/tmp")).audit;
            let converger = Arc::new(RecordingConverger::new());
            let authority = Arc::new(ScriptedAuthority::new());
            let sink = Arc::new(RecordingAuditSink::new());
            let completions = Arc::new(AtomicUsize::new(0));

            let (queue, inbox) = BundleQueue::channel();
            let counter = completions.clone();
            let actor = BundleQueueActor::new(
                inbox,
                converger.clone(),
                authority.clone(),
                AuditFactory::new(sink.clone(), &config),
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
            tokio::spawn(actor.run());
            Self {
                queue,
                converger,
                authority,
                sink,
                completions,
                config,
            }
        }

        fn push(&self, name: &str) {
            let audit = AuditBuffer::spawn(0, self.sink.clone(), &self.config);
            self.queue
                .push(BundleContext::new(Bundle::new(name, vec![]), audit))
                .unwrap();
        }

        fn push_decommission(&self, name: &str) {
            let audit = AuditBuffer::spawn(0, self.sink.clone(), &self.config);
            self.queue
                .push(BundleContext::decommission(Bundle::new(name, vec![]), audit))
                .unwrap();
        }

        fn statuses(&self) -> Vec<String> {
            self.sink
                .entries()
                .into_iter()
                .filter(|e| e.kind == AuditEntryKind::Status)
                .map(|e| e.text)
                .collect()
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_in_order_then_completes_once() {
        let fx = Fixture::start();
        fx.push("a");
        fx.push("b");
        fx.queue.activate().unwrap();
        fx.queue.activate().unwrap();
        fx.push("c");
        fx.queue.close().unwrap();
        settle().await;

        assert_eq!(fx.converger.converged(), vec!["a", "b", "c"]);
        assert_eq!(fx.completions.load(Ordering::SeqCst), 1);
        let status = fx.queue.status();
        assert!(!status.active);
        assert_eq!(status.completed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_queue_holds_bundles() {
        let fx = Fixture::start();
        fx.push("a");
        settle().await;
        assert!(fx.converger.converged().is_empty());
        assert_eq!(fx.queue.status().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_bundle_in_flight() {
        let fx = Fixture::start();
        fx.converger.set_delay(Duration::from_secs(1));
        fx.queue.activate().unwrap();
        fx.push("a");
        fx.push("b");
        settle().await;

        assert_eq!(fx.converger.started(), vec!["a"]);
        assert!(fx.queue.status().busy);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(fx.converger.started(), vec!["a", "b"]);
        assert_eq!(fx.converger.max_concurrent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_audited_and_queue_continues() {
        let fx = Fixture::start();
        fx.converger.fail("broken");
        fx.queue.activate().unwrap();
        fx.push("broken");
        fx.push("fine");
        fx.queue.close().unwrap();
        tokio::time::sleep(fx.config.flush_delay()).await;

        assert_eq!(fx.converger.converged(), vec!["broken", "fine"]);
        assert_eq!(fx.statuses(), vec!["failed: broken", "completed: fine"]);
        assert_eq!(fx.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_converge_counts_as_failure() {
        let fx = Fixture::start();
        fx.converger.panic_on("boom");
        fx.queue.activate().unwrap();
        fx.push("boom");
        fx.push("after");
        tokio::time::sleep(fx.config.flush_delay()).await;

        assert_eq!(fx.statuses(), vec!["failed: boom", "completed: after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_shutdown_skips_until_decommission() {
        let fx = Fixture::start();
        fx.authority.set_immediate(true);
        fx.queue.activate().unwrap();
        fx.push("operational");
        fx.push_decommission("decommission");
        fx.queue.close().unwrap();
        tokio::time::sleep(fx.config.flush_delay()).await;

        assert_eq!(fx.converger.converged(), vec!["decommission"]);
        assert_eq!(
            fx.statuses(),
            vec![
                "skipped due to immediate shutdown: operational",
                "decommission completed: decommission"
            ]
        );
        assert_eq!(fx.queue.status().skipped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sentinel_handled_once() {
        let fx = Fixture::start();
        fx.queue.activate().unwrap();
        fx.queue.push_shutdown().unwrap();
        fx.queue.push_shutdown().unwrap();
        fx.push("after");
        settle().await;

        assert_eq!(fx.authority.managed(), 1);
        assert_eq!(fx.sink.created().len(), 1);
        assert_eq!(fx.converger.converged(), vec!["after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decommission_runs_before_close() {
        let fx = Fixture::start();
        fx.authority.decommission_with(Bundle::new("decommission", vec![]));
        fx.queue.activate().unwrap();
        fx.queue.push_shutdown().unwrap();
        fx.push("later");
        fx.queue.close().unwrap();
        settle().await;

        assert_eq!(fx.converger.converged(), vec!["decommission", "later"]);
        assert_eq!(fx.completions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_authority_resumes_queue() {
        let fx = Fixture::start();
        fx.authority.panic_on_manage();
        fx.queue.activate().unwrap();
        fx.queue.push_shutdown().unwrap();
        fx.push("after");
        fx.queue.close().unwrap();
        settle().await;

        assert_eq!(fx.authority.managed(), 1);
        assert_eq!(fx.converger.converged(), vec!["after"]);
        assert_eq!(fx.completions.load(Ordering::SeqCst), 1);
        assert!(!fx.queue.status().busy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_waiting_bundles_only() {
        let fx = Fixture::start();
        fx.push("a");
        fx.push("b");
        fx.queue.close().unwrap();
        fx.queue.clear().unwrap();
        fx.queue.activate().unwrap();
        settle().await;

        assert!(fx.converger.converged().is_empty());
        assert_eq!(fx.completions.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_bundles_run_fifo_exactly_once(names in prop::collection::vec("[a-z]{1,8}", 0..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let (converged, completions) = runtime.block_on(async {
                let fx = Fixture::start();
                fx.queue.activate().unwrap();
                for name in &names {
                    fx.push(name);
                }
                fx.queue.close().unwrap();
                settle().await;
                (fx.converger.converged(), fx.completions.load(Ordering::SeqCst))
            });
            prop_assert_eq!(converged, names);
            prop_assert_eq!(completions, 1);
        }
    }
}
