//! Instance lifecycle: persisted state, boot reconciliation and reporting.

pub mod host;
pub mod machine;
pub mod state;

pub use host::{HostProbe, SystemHostProbe};
pub use machine::{BootKind, LifecycleActor, LifecycleHandle, LifecycleSnapshot, StateObserver};
pub use state::{LifecycleState, PersistedState, StateStore};
