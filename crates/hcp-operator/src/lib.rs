//! Reconciler that drives ARO HCP Operations to a terminal state

#![deny(missing_docs)]

/// Worker pool, change handling and resync
pub mod controller;
/// External status providers
pub mod provider;
/// SIGINT/SIGTERM handling shared by the binaries
pub mod shutdown;
/// Store and cache seams with in-memory and Kubernetes implementations
pub mod store;
/// Per-Operation state machine
pub mod sync;

pub use controller::{Context, Controller, ControllerConfig};
pub use provider::{
    HttpStatusProvider, ProbeStatus, StaticResponse, StaticStatusProvider, StatusProvider,
};
pub use store::{KubeOperationCache, KubeOperationStore, MemoryStore, OperationCache, OperationStore};
pub use sync::{sync_operation, SyncOutcome};
