//! The global/local store operation protocol.
//!
//! A `StoreOperation` moves through
//! `Created -> GlobalPreLocalExecuted -> LocalSourceExecuted ->
//! [LocalTargetExecuted ->] GlobalPostLocalExecuted`, or back through the
//! undo states. The `driver` sequences the steps; `steps` holds the default
//! store-backed implementation; `fault` can wrap it to inject failures.

mod driver;
mod fault;
mod kind;
mod steps;

pub use driver::OperationDriver;
pub use fault::{FaultInjector, Step};
pub use kind::{OperationKind, OperationOutput};
pub use steps::{OperationSteps, StoreSteps};

use serde::{Deserialize, Serialize};
use shardmeta_common::{Error, OperationId, Result, ShardMap};
use shardmeta_store::{OperationState, StoredOperation};

/// One mutating call against a shard map
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOperation {
    pub id: OperationId,
    /// Shard map handle the caller presented
    pub shard_map: ShardMap,
    pub kind: OperationKind,
    pub state: OperationState,
    /// Unix milliseconds
    pub created_at: i64,
    pub attempts: u32,
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    shard_map: &'a ShardMap,
    kind: &'a OperationKind,
}

#[derive(Deserialize)]
struct Payload {
    shard_map: ShardMap,
    kind: OperationKind,
}

impl StoreOperation {
    #[must_use]
    pub fn new(shard_map: ShardMap, kind: OperationKind) -> Self {
        Self {
            id: OperationId::new(),
            shard_map,
            kind,
            state: OperationState::Created,
            created_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Pending-entry form of this operation at its current state
    pub fn to_record(&self) -> Result<StoredOperation> {
        let payload = bincode::serialize(&PayloadRef {
            shard_map: &self.shard_map,
            kind: &self.kind,
        })
        .map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(StoredOperation {
            id: self.id,
            shard_map_id: self.shard_map.id,
            shard_map_name: self.shard_map.name.clone(),
            kind: self.name().to_string(),
            state: self.state,
            payload,
            created_at: self.created_at,
            attempts: self.attempts,
        })
    }

    pub fn from_record(record: &StoredOperation) -> Result<Self> {
        let payload: Payload = bincode::deserialize(&record.payload).map_err(|e| {
            Error::Serialization(format!("pending operation {}: {e}", record.id))
        })?;
        Ok(Self {
            id: record.id,
            shard_map: payload.shard_map,
            kind: payload.kind,
            state: record.state,
            created_at: record.created_at,
            attempts: record.attempts,
        })
    }
}
