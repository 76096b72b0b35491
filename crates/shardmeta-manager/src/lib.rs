//! ShardMeta Manager
//!
//! Keeps shard map metadata consistent between the global store and the
//! local store of each shard. Every mutation runs as a `StoreOperation`:
//! a global pre-check that records a pending entry, the local change(s),
//! then the global commit, with compensating undo and bounded retries for
//! transient faults.

pub mod manager;
pub mod operation;
pub mod retry;
pub mod schema;

pub use manager::{DistinctShardLocations, ManagerConfig, ShardMapManager};
pub use operation::{
    FaultInjector, OperationDriver, OperationKind, OperationOutput, OperationSteps, Step,
    StoreOperation, StoreSteps,
};
pub use retry::{
    DefaultFaultClassifier, FaultClassifier, FaultKind, RetryCallback, RetryEvent, RetryPolicy,
};
pub use schema::{
    BuiltinUpgradeScripts, SchemaVersionManager, UnlockScope, UpgradeScripts, UpgradeStep,
};
