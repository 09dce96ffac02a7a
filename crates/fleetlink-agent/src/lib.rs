//! # fleetlink-agent
//!
//! Node-resident agent keeping a managed instance in sync with its fleet
//! coordinator.
//!
//! ## Services
//!
//! - **Lifecycle** ([`lifecycle`]): persisted instance state, reboot and
//!   re-image reconciliation, bounded-retry reporting to the coordinator
//! - **Forwarder** ([`forwarder`]): buffers coordinator calls while the link
//!   is down and replays them in order; escalates long outages to
//!   re-enrollment
//! - **Bundle queue** ([`bundle`]): runs configuration bundles one at a time
//!   and handles shutdown and decommission
//! - **Audit buffer** ([`audit`]): batches converge output into audit
//!   entries
//!
//! Each service is a single tokio task owning its state behind a cloneable
//! handle. [`AgentRuntime`] builds and wires them.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleetlink_agent::{AgentConfig, AgentRuntime, Bundle, Collaborators};
//!
//! let config = AgentConfig::load(path)?;
//! fleetlink_agent::logging::init_tracing_from_state(&config.lifecycle);
//!
//! let collaborators = Collaborators::new(client, host, converger);
//! let runtime = AgentRuntime::start(&config, "i-0abc", collaborators)?;
//! runtime.forwarder().init(|_| async {}).await?;
//! runtime.activate()?;
//! runtime.run_bundle(Bundle::new("boot", vec![])).await?;
//! runtime.shutdown().await?;
//! ```

pub mod audit;
pub mod bundle;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod forwarder;
pub mod lifecycle;
pub mod logging;
pub mod runtime;
pub mod task_registry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

mod timer;

pub use audit::{AuditBuffer, AuditEntry, AuditEntryKind, AuditFactory, AuditSink, EventCategory};
pub use bundle::{
    Bundle, BundleContext, BundleQueue, ConvergeOutcome, Converger, ShutdownAuthority,
    ShutdownLevel, ShutdownRequest,
};
pub use config::AgentConfig;
pub use coordinator::{CoordinatorClient, RequestOptions};
pub use errors::{AgentError, AgentResult, RecordStateError, TransportError};
pub use forwarder::{ForwarderHandle, ForwarderMode, ReenrollManager, ReenrollVoter};
pub use lifecycle::{HostProbe, LifecycleHandle, LifecycleState};
pub use runtime::{AgentRuntime, Collaborators};
pub use task_registry::TaskRegistry;
