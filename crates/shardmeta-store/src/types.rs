//! Persisted records that are not part of the public domain model.

use serde::{Deserialize, Serialize};
use shardmeta_common::{OperationId, ShardMapId};
use std::fmt;

/// Which role a store plays
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Global,
    Local,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Local => write!(f, "local"),
        }
    }
}

/// Last step of a store operation that completed and was recorded.
///
/// Forward steps run `GlobalPreLocal -> LocalSource -> LocalTarget ->
/// GlobalPostLocal`; undo runs `UndoLocalTarget -> UndoLocalSource ->
/// UndoGlobalPreLocal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationState {
    Created,
    GlobalPreLocalExecuted,
    LocalSourceExecuted,
    LocalTargetExecuted,
    GlobalPostLocalExecuted,
    UndoLocalTargetExecuted,
    UndoLocalSourceExecuted,
    UndoGlobalPreLocalExecuted,
}

impl OperationState {
    /// Whether undo has started for this operation
    #[must_use]
    pub const fn is_undoing(self) -> bool {
        matches!(
            self,
            Self::UndoLocalTargetExecuted
                | Self::UndoLocalSourceExecuted
                | Self::UndoGlobalPreLocalExecuted
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A store operation that has executed its global pre-local step and has
/// not finished (or been undone) yet.
///
/// The engine owns the payload format; the store only keys the record by
/// shard map so that at most one is outstanding per map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredOperation {
    pub id: OperationId,
    pub shard_map_id: ShardMapId,
    pub shard_map_name: String,
    /// Operation kind name, for listings
    pub kind: String,
    pub state: OperationState,
    /// Engine-defined encoding of the operation and its pre-images
    pub payload: Vec<u8>,
    /// Unix milliseconds
    pub created_at: i64,
    /// Executions of the step sequence so far, across callers
    pub attempts: u32,
}
