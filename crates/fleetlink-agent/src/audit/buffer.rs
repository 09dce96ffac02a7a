//! # Audit Buffer
//!
//! Aggregates free-form converge output into few, large audit entries.
//! Output accumulates until either the configured size is exceeded or the
//! flush delay passes without a new append. Structured entries (status,
//! info, error, new section) flush pending output first so the auditor
//! sees everything in the order it was written.
//!
//! Each audit is one actor task. It exits once every [`AuditBuffer`] handle
//! is dropped, flushing whatever is still buffered.

use super::entry::{AuditEntry, AuditEntryKind, AuditId, EventCategory};
use super::sink::{AuditSink, LogAuditSink};
use crate::config::AuditConfig;
use crate::errors::{AgentError, AgentResult, TransportError};
use crate::timer::Timer;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

enum Command {
    Output { kind: AuditEntryKind, text: String },
    Entry {
        kind: AuditEntryKind,
        text: String,
        category: EventCategory,
    },
    Flush(oneshot::Sender<()>),
}

/// Handle to one audit
#[derive(Clone)]
pub struct AuditBuffer {
    audit_id: AuditId,
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for AuditBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditBuffer")
            .field("audit_id", &self.audit_id)
            .finish_non_exhaustive()
    }
}

impl AuditBuffer {
    /// Start buffering for an existing audit.
    pub fn spawn(audit_id: AuditId, sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let accumulator = Accumulator {
            audit_id,
            sink,
            config: config.clone(),
            commands: receiver,
            buffered: String::new(),
            buffered_kind: AuditEntryKind::Output,
            offset: 0,
            flush_timer: Timer::idle(),
        };
        tokio::spawn(accumulator.run());
        Self { audit_id, commands }
    }

    /// Audit that only writes to the local log.
    pub fn detached(config: &AuditConfig) -> Self {
        Self::spawn(0, Arc::new(LogAuditSink), config)
    }

    /// Audit the buffer writes to; 0 when detached
    pub fn audit_id(&self) -> AuditId {
        self.audit_id
    }

    /// Append formatted output
    pub fn append_output(&self, text: impl Into<String>) -> AgentResult<()> {
        self.output(AuditEntryKind::Output, text.into())
    }

    /// Append output that must be shown verbatim
    pub fn append_raw_output(&self, text: impl Into<String>) -> AgentResult<()> {
        self.output(AuditEntryKind::RawOutput, text.into())
    }

    /// Append an informational line
    pub fn append_info(
        &self,
        text: impl Into<String>,
        category: Option<&str>,
    ) -> AgentResult<()> {
        self.entry(AuditEntryKind::Info, text.into(), category)
    }

    /// Append an error line
    pub fn append_error(
        &self,
        text: impl Into<String>,
        category: Option<&str>,
    ) -> AgentResult<()> {
        self.entry(AuditEntryKind::Error, text.into(), category)
    }

    /// Replace the audit's summary line
    pub fn update_status(
        &self,
        text: impl Into<String>,
        category: Option<&str>,
    ) -> AgentResult<()> {
        self.entry(AuditEntryKind::Status, text.into(), category)
    }

    /// Start a titled section
    pub fn create_new_section(
        &self,
        title: impl Into<String>,
        category: Option<&str>,
    ) -> AgentResult<()> {
        self.entry(AuditEntryKind::NewSection, title.into(), category)
    }

    /// Send buffered output now.
    ///
    /// Returns once everything appended before the call reached the sink.
    pub async fn flush(&self) -> AgentResult<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Flush(reply))?;
        done.await.map_err(|_| AgentError::stopped("audit"))
    }

    fn output(&self, kind: AuditEntryKind, text: String) -> AgentResult<()> {
        self.send(Command::Output { kind, text })
    }

    fn entry(&self, kind: AuditEntryKind, text: String, category: Option<&str>) -> AgentResult<()> {
        let category = EventCategory::from_label(category);
        self.send(Command::Entry {
            kind,
            text,
            category,
        })
    }

    fn send(&self, command: Command) -> AgentResult<()> {
        self.commands
            .send(command)
            .map_err(|_| AgentError::stopped("audit"))
    }
}

struct Accumulator {
    audit_id: AuditId,
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    buffered: String,
    buffered_kind: AuditEntryKind,
    offset: u64,
    flush_timer: Timer,
}

impl Accumulator {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = self.flush_timer.fired() => self.flush(),
            }
        }
        self.flush();
        debug!(audit_id = self.audit_id, offset = self.offset, "Audit closed");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Output { kind, text } => {
                if kind != self.buffered_kind {
                    self.flush();
                    self.buffered_kind = kind;
                }
                self.buffered.push_str(&text);
                if self.buffered.len() > self.config.max_buffer_bytes {
                    self.flush();
                } else {
                    self.flush_timer.arm(self.config.flush_delay());
                }
            }
            Command::Entry {
                kind,
                text,
                category,
            } => {
                self.flush();
                self.send(kind, text, category);
            }
            Command::Flush(reply) => {
                self.flush();
                let _ = reply.send(());
            }
        }
    }

    fn flush(&mut self) {
        self.flush_timer.cancel();
        if self.buffered.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.buffered);
        self.send(self.buffered_kind, text, EventCategory::None);
    }

    fn send(&mut self, kind: AuditEntryKind, text: String, category: EventCategory) {
        let offset = self.offset;
        self.offset += text.len() as u64;
        self.sink.update_entry(AuditEntry {
            audit_id: self.audit_id,
            kind,
            text,
            category,
            offset,
        });
    }
}

/// Opens audits on the coordinator
#[derive(Clone)]
pub struct AuditFactory {
    sink: Arc<dyn AuditSink>,
    config: AuditConfig,
}

impl AuditFactory {
    /// Factory opening audits through `sink`
    pub fn new(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        Self {
            sink,
            config: config.clone(),
        }
    }

    /// Create a new audit entry and return a buffer writing to it.
    pub async fn create_audit(
        &self,
        summary: &str,
        category: Option<&str>,
    ) -> Result<AuditBuffer, TransportError> {
        let category = EventCategory::from_label(category);
        let audit_id = self.sink.create_entry(summary, category).await?;
        info!(audit_id, %category, "Opened audit: {}", summary);
        Ok(self.attach(audit_id))
    }

    /// Continue writing to an audit opened elsewhere
    pub fn attach(&self, audit_id: AuditId) -> AuditBuffer {
        AuditBuffer::spawn(audit_id, self.sink.clone(), &self.config)
    }

    /// Audit that only writes to the local log
    pub fn detached(&self) -> AuditBuffer {
        AuditBuffer::detached(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::testing::RecordingAuditSink;
    use std::time::Duration;

    fn config() -> AuditConfig {
        AgentConfig::for_testing(std::path::Path::new("/tmp")).audit
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_flushed_after_quiet_period() {
        let config = config();
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(3, sink.clone(), &config);

        audit.append_output("hello ").unwrap();
        tokio::time::sleep(config.flush_delay() / 2).await;
        audit.append_output("world").unwrap();
        tokio::time::sleep(config.flush_delay() / 2).await;
        assert!(sink.entries().is_empty());

        tokio::time::sleep(config.flush_delay()).await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "hello world");
        assert_eq!(entries[0].kind, AuditEntryKind::Output);
        assert_eq!(entries[0].audit_id, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_output_flushes_immediately() {
        let config = config();
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(1, sink.clone(), &config);

        audit.append_output("a".repeat(config.max_buffer_bytes)).unwrap();
        settle().await;
        assert!(sink.entries().is_empty());

        audit.append_output("b").unwrap();
        settle().await;
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text.len(), config.max_buffer_bytes + 1);

        // Nothing left for the timer to send
        tokio::time::sleep(config.flush_delay() * 2).await;
        assert_eq!(sink.entries().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_structured_entry_flushes_output_first() {
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(1, sink.clone(), &config());

        audit.append_output("compiling").unwrap();
        audit.append_error("compile failed", Some("error")).unwrap();
        audit.flush().await.unwrap();

        let entries = sink.entries();
        let kinds: Vec<_> = entries.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![AuditEntryKind::Output, AuditEntryKind::Error]);
        assert_eq!(entries[1].category, EventCategory::Error);
        assert_eq!(entries[1].offset, "compiling".len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_output_kind_flushes() {
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(1, sink.clone(), &config());

        audit.append_output("formatted").unwrap();
        audit.append_raw_output("raw").unwrap();
        audit.flush().await.unwrap();

        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, AuditEntryKind::Output);
        assert_eq!(entries[1].kind, AuditEntryKind::RawOutput);
        assert_eq!(entries[1].offset, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_category_falls_back_to_none() {
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(1, sink.clone(), &config());

        audit.update_status("completed: boot", Some("urgent")).unwrap();
        audit.flush().await.unwrap();
        assert_eq!(sink.entries()[0].category, EventCategory::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_last_handle_flushes() {
        let sink = Arc::new(RecordingAuditSink::new());
        let audit = AuditBuffer::spawn(1, sink.clone(), &config());
        audit.append_output("tail").unwrap();
        drop(audit);
        settle().await;

        assert_eq!(sink.entries()[0].text, "tail");
    }

    #[tokio::test(start_paused = true)]
    async fn test_factory_opens_audit() {
        let sink = Arc::new(RecordingAuditSink::new());
        let factory = AuditFactory::new(sink.clone(), &config());

        let audit = factory.create_audit("boot", Some("notification")).await.unwrap();
        assert_eq!(
            sink.created(),
            vec![("boot".to_string(), EventCategory::Notification)]
        );
        assert_eq!(audit.audit_id(), 1);
    }
}
