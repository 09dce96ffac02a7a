//! Offline-tolerant delivery of coordinator requests and re-enrollment voting.

pub mod reenroll;
pub mod service;

pub use reenroll::{ReenrollManager, ReenrollVoter};
pub use service::{
    ForwarderActor, ForwarderHandle, ForwarderMode, ForwarderStats, OperationKind, PendingReply,
    QueuedOperation,
};
