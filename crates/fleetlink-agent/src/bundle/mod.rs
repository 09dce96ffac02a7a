//! Serial bundle execution and shutdown handling.

pub mod context;
pub mod queue;
pub mod shutdown;

pub use context::{
    Bundle, BundleContext, ConvergeOutcome, Converger, ScheduledHook, ShutdownAuthority,
};
pub use queue::{BundleQueue, BundleQueueActor, BundleQueueInbox, CompletionHook, QueueStatus};
pub use shutdown::{DecommissionHook, ShutdownLevel, ShutdownRequest};
