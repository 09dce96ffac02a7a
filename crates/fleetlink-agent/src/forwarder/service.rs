//! # Offline Request Forwarder
//!
//! Sits between agent services and the coordinator transport. While the
//! link is up, operations go straight to the transport. While it is down
//! (or before the forwarder finished initializing) they are buffered, and
//! replayed in order once the link returns.
//!
//! ## Modes
//!
//! - `Initializing`: buffering until [`ForwarderHandle::init`] completes
//! - `Online`: dispatching directly
//! - `Offline`: buffering, voting for re-enrollment on a timer
//!
//! Leaving `Offline` waits a random jitter (so a fleet reconnecting at once
//! does not stampede the coordinator), then replays the buffer one
//! operation at a time: the next one is only handed over once the transport
//! call for the previous one returned. The mode flips to `Online` only once
//! the buffer is empty. Losing the link again mid-drain stops the drain; the
//! undelivered remainder stays buffered for the next reconnect.
//!
//! Every transport call, replayed or direct, goes through a single
//! dispatcher task that awaits them in submission order. The forwarder
//! never retries a dispatch. Delivery guarantees beyond ordering belong to
//! the transport.

use super::reenroll::ReenrollVoter;
use crate::config::ForwarderConfig;
use crate::coordinator::{CoordinatorClient, RequestOptions};
use crate::errors::{AgentError, AgentResult, TransportError};
use crate::timer::Timer;
use rand::Rng;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Connection mode of the forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderMode {
    /// Buffering until init completes
    Initializing,
    /// Dispatching directly
    Online,
    /// Buffering while the link is down
    Offline,
}

/// Whether the caller expects a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Expects a response
    Request,
    /// Fire and forget
    Push,
}

/// An outbound coordinator call, possibly buffered
#[derive(Debug)]
pub struct QueuedOperation {
    /// Request or push
    pub kind: OperationKind,
    /// Coordinator endpoint
    pub target: String,
    /// JSON body
    pub payload: Value,
    /// Transport options
    pub options: RequestOptions,
    reply: Option<oneshot::Sender<Result<Value, TransportError>>>,
}

/// Response to a [`ForwarderHandle::request`], available once the request
/// has actually been dispatched.
#[derive(Debug)]
pub struct PendingReply {
    receiver: oneshot::Receiver<Result<Value, TransportError>>,
}

impl PendingReply {
    /// Wait for the coordinator's answer.
    ///
    /// Resolves to [`TransportError::Abandoned`] if the forwarder stopped
    /// before the request was sent.
    pub async fn response(self) -> Result<Value, TransportError> {
        self.receiver.await.unwrap_or(Err(TransportError::Abandoned))
    }
}

/// Diagnostic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    /// Operations currently buffered
    pub queued: usize,
    /// Operations ever buffered
    pub total_queued: u64,
    /// Operations handed to the transport
    pub dispatched: u64,
    /// Re-enrollment votes cast
    pub votes: u64,
    /// Drains halted by a new outage
    pub drains_aborted: u64,
}

enum Command {
    Submit(QueuedOperation),
    BeginInit,
    FinishInit,
    EnableOffline,
    DisableOffline,
    Stats(oneshot::Sender<ForwarderStats>),
}

/// Handle to the forwarder actor
#[derive(Clone)]
pub struct ForwarderHandle {
    commands: mpsc::UnboundedSender<Command>,
    mode: watch::Receiver<ForwarderMode>,
}

impl ForwarderHandle {
    /// Current mode
    pub fn mode(&self) -> ForwarderMode {
        *self.mode.borrow()
    }

    /// Watch mode changes
    pub fn subscribe(&self) -> watch::Receiver<ForwarderMode> {
        self.mode.clone()
    }

    /// Finish initialization.
    ///
    /// `on_ready` runs first; operations it issues are buffered ahead of
    /// anything queued before `init` was called. Afterwards the buffer is
    /// drained and the forwarder goes online, unless offline mode was
    /// entered while the hook ran. The hook must not wait on replies to its
    /// own requests, they are only sent after it returns.
    pub async fn init<F, Fut>(&self, on_ready: F) -> AgentResult<()>
    where
        F: FnOnce(ForwarderHandle) -> Fut,
        Fut: Future<Output = ()>,
    {
        self.send(Command::BeginInit)?;
        on_ready(self.clone()).await;
        self.send(Command::FinishInit)
    }

    /// Send a request, buffering it while offline.
    pub fn request(
        &self,
        target: impl Into<String>,
        payload: Value,
        options: RequestOptions,
    ) -> AgentResult<PendingReply> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Submit(QueuedOperation {
            kind: OperationKind::Request,
            target: target.into(),
            payload,
            options,
            reply: Some(reply),
        }))?;
        Ok(PendingReply { receiver })
    }

    /// Push a one-way message, buffering it while offline.
    pub fn push(
        &self,
        target: impl Into<String>,
        payload: Value,
        options: RequestOptions,
    ) -> AgentResult<()> {
        self.send(Command::Submit(QueuedOperation {
            kind: OperationKind::Push,
            target: target.into(),
            payload,
            options,
            reply: None,
        }))
    }

    /// The coordinator link went down
    pub fn enable_offline_mode(&self) -> AgentResult<()> {
        self.send(Command::EnableOffline)
    }

    /// The coordinator link came back
    pub fn disable_offline_mode(&self) -> AgentResult<()> {
        self.send(Command::DisableOffline)
    }

    /// Snapshot of the diagnostic counters
    pub async fn stats(&self) -> AgentResult<ForwarderStats> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        response.await.map_err(|_| AgentError::stopped("forwarder"))
    }

    fn send(&self, command: Command) -> AgentResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AgentError::stopped("forwarder"))
    }
}

/// An operation handed to the dispatcher, with an optional signal fired
/// once its transport call returned.
struct Dispatch {
    operation: QueuedOperation,
    done: Option<oneshot::Sender<()>>,
}

/// Sole caller of the transport. Awaits each call before taking the next,
/// so operations reach the coordinator in the order they were handed over.
struct Dispatcher {
    coordinator: Arc<dyn CoordinatorClient>,
    jobs: mpsc::UnboundedReceiver<Dispatch>,
}

impl Dispatcher {
    async fn run(mut self) {
        while let Some(Dispatch { operation, done }) = self.jobs.recv().await {
            self.call(operation).await;
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
    }

    async fn call(&self, operation: QueuedOperation) {
        let QueuedOperation {
            kind,
            target,
            payload,
            options,
            reply,
        } = operation;
        match kind {
            OperationKind::Request => {
                let result = self.coordinator.request(&target, payload, &options).await;
                if let Err(e) = &result {
                    debug!(%target, "Request failed: {}", e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            OperationKind::Push => {
                if let Err(e) = self.coordinator.push(&target, payload, &options).await {
                    debug!(%target, "Push failed: {}", e);
                }
            }
        }
    }
}

/// Actor owning the buffer
pub struct ForwarderActor {
    config: ForwarderConfig,
    voter: Arc<dyn ReenrollVoter>,
    commands: mpsc::UnboundedReceiver<Command>,
    dispatcher: Option<Dispatcher>,
    jobs: mpsc::UnboundedSender<Dispatch>,
    /// Completion of the replayed operation currently at the transport
    in_flight: Option<oneshot::Receiver<()>>,
    mode_tx: watch::Sender<ForwarderMode>,
    mode: ForwarderMode,
    queue: VecDeque<QueuedOperation>,
    /// Insert position for operations issued by the init hook
    init_cursor: Option<usize>,
    queued_since_vote: usize,
    draining: bool,
    vote_timer: Timer,
    jitter_timer: Timer,
    stats: ForwarderStats,
}

impl ForwarderActor {
    /// Create the actor in `Initializing` mode and its handle.
    pub fn new(
        config: &ForwarderConfig,
        coordinator: Arc<dyn CoordinatorClient>,
        voter: Arc<dyn ReenrollVoter>,
    ) -> (ForwarderHandle, ForwarderActor) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (mode_tx, mode_rx) = watch::channel(ForwarderMode::Initializing);
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let actor = ForwarderActor {
            config: config.clone(),
            voter,
            commands,
            dispatcher: Some(Dispatcher {
                coordinator,
                jobs: jobs_rx,
            }),
            jobs,
            in_flight: None,
            mode_tx,
            mode: ForwarderMode::Initializing,
            queue: VecDeque::new(),
            init_cursor: None,
            queued_since_vote: 0,
            draining: false,
            vote_timer: Timer::idle(),
            jitter_timer: Timer::idle(),
            stats: ForwarderStats::default(),
        };
        let handle = ForwarderHandle {
            commands: commands_tx,
            mode: mode_rx,
        };
        (handle, actor)
    }

    /// Run until every handle is dropped. Operations already handed to the
    /// dispatcher are still sent; buffered ones are dropped.
    pub async fn run(mut self) {
        let dispatcher = self.dispatcher.take();
        let dispatch = async move {
            if let Some(dispatcher) = dispatcher {
                dispatcher.run().await;
            }
        };
        tokio::join!(self.serve(), dispatch);
    }

    async fn serve(mut self) {
        loop {
            // Commands win over drain steps so a new outage halts the drain
            // before the next dispatch.
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = delivered(&mut self.in_flight), if self.in_flight.is_some() => {
                    self.in_flight = None;
                }
                _ = self.vote_timer.fired() => {
                    info!(queued = self.queue.len(), "Still offline, voting to re-enroll");
                    self.cast_vote();
                    self.vote_timer.arm(self.config.reenroll_vote_interval());
                }
                _ = self.jitter_timer.fired() => self.begin_drain(),
                _ = std::future::ready(()), if self.draining && self.in_flight.is_none() => {
                    self.drain_step();
                }
            }
        }
        debug!(dropped = self.queue.len(), "Forwarder stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit(operation) => {
                if self.mode == ForwarderMode::Online {
                    self.dispatch(operation);
                } else {
                    self.enqueue(operation);
                }
            }
            Command::BeginInit => {
                if self.mode == ForwarderMode::Initializing && self.init_cursor.is_none() {
                    self.init_cursor = Some(0);
                } else {
                    warn!(mode = ?self.mode, "Ignoring repeated forwarder init");
                }
            }
            Command::FinishInit => self.finish_init(),
            Command::EnableOffline => self.enable_offline(),
            Command::DisableOffline => self.disable_offline(),
            Command::Stats(reply) => {
                let mut stats = self.stats.clone();
                stats.queued = self.queue.len();
                let _ = reply.send(stats);
            }
        }
    }

    fn enqueue(&mut self, operation: QueuedOperation) {
        debug!(target = %operation.target, kind = ?operation.kind, "Buffering operation");
        match self.init_cursor.as_mut() {
            Some(cursor) => {
                self.queue.insert(*cursor, operation);
                *cursor += 1;
            }
            None => self.queue.push_back(operation),
        }
        self.stats.total_queued += 1;

        self.queued_since_vote += 1;
        if self.queued_since_vote >= self.config.max_queued_requests {
            warn!(
                queued = self.queue.len(),
                max = self.config.max_queued_requests,
                "Offline queue reached its limit, voting to re-enroll"
            );
            self.queued_since_vote = 0;
            self.cast_vote();
        }
    }

    fn finish_init(&mut self) {
        if self.init_cursor.take().is_none() {
            return;
        }
        if self.mode == ForwarderMode::Offline {
            info!(queued = self.queue.len(), "Went offline during init, keeping buffer");
            return;
        }
        info!(queued = self.queue.len(), "Forwarder initialized");
        self.begin_drain();
    }

    fn enable_offline(&mut self) {
        if self.draining || self.jitter_timer.is_armed() {
            info!(remaining = self.queue.len(), "Connection lost while flushing, halting replay");
            self.draining = false;
            self.jitter_timer.cancel();
            self.stats.drains_aborted += 1;
        } else if self.mode == ForwarderMode::Offline {
            return;
        }

        if self.mode == ForwarderMode::Online {
            self.queue.clear();
            self.queued_since_vote = 0;
        }
        if self.mode != ForwarderMode::Offline {
            info!("Connection to coordinator lost, entering offline mode");
            self.set_mode(ForwarderMode::Offline);
        }
        self.vote_timer
            .arm_if_idle(self.config.reenroll_vote_interval());
    }

    fn disable_offline(&mut self) {
        if self.mode != ForwarderMode::Offline || self.draining || self.jitter_timer.is_armed() {
            return;
        }
        self.vote_timer.cancel();

        let max_jitter = self.config.max_flush_jitter_ms;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        info!(
            queued = self.queue.len(),
            delay_ms = jitter,
            "Connection to coordinator restored, flushing after delay"
        );
        self.jitter_timer.arm(Duration::from_millis(jitter));
    }

    fn begin_drain(&mut self) {
        debug!(queued = self.queue.len(), "Starting to flush request queue");
        self.draining = true;
    }

    fn drain_step(&mut self) {
        match self.queue.pop_front() {
            Some(operation) => {
                self.in_flight = self.dispatch(operation);
            }
            None => {
                self.draining = false;
                self.queued_since_vote = 0;
                info!(dispatched = self.stats.dispatched, "Request queue flushed, online");
                self.set_mode(ForwarderMode::Online);
            }
        }
    }

    /// Hand `operation` to the dispatcher. The returned receiver resolves
    /// once its transport call returned.
    fn dispatch(&mut self, operation: QueuedOperation) -> Option<oneshot::Receiver<()>> {
        let (done, finished) = oneshot::channel();
        let target = operation.target.clone();
        let job = Dispatch {
            operation,
            done: Some(done),
        };
        if self.jobs.send(job).is_err() {
            warn!(%target, "Dispatcher stopped, dropping operation");
            return None;
        }
        self.stats.dispatched += 1;
        Some(finished)
    }

    fn cast_vote(&mut self) {
        self.stats.votes += 1;
        self.voter.vote();
    }

    fn set_mode(&mut self, mode: ForwarderMode) {
        self.mode = mode;
        self.mode_tx.send_replace(mode);
    }
}

async fn delivered(in_flight: &mut Option<oneshot::Receiver<()>>) {
    if let Some(finished) = in_flight {
        let _ = finished.await;
    }
}
