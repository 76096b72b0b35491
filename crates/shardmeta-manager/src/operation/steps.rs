//! Step capability trait and its store-backed implementation.

use super::{OperationOutput, StoreOperation};
use crate::schema;
use shardmeta_common::{Error, Result, SchemaVersion, ShardLocation};
use shardmeta_store::{
    MetaStore, OperationState, StoreKind, StoreProvider, StoreRead, StoreTxn,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// The individual steps of a store operation.
///
/// Each step must be safe to repeat for the same operation id.
pub trait OperationSteps: Send + Sync {
    /// Check preconditions and record the pending entry
    fn global_pre_local(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()>;
    fn local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()>;
    fn local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()>;
    /// Commit the global rows and remove the pending entry
    fn global_post_local(
        &self,
        stores: &dyn StoreProvider,
        op: &StoreOperation,
    ) -> Result<OperationOutput>;
    fn undo_local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()>;
    fn undo_local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()>;
    /// Remove the pending entry
    fn undo_global_pre_local(&self, stores: &dyn StoreProvider, op: &StoreOperation)
    -> Result<()>;
}

/// Steps that read and write the provider's stores
#[derive(Clone, Copy, Debug, Default)]
pub struct StoreSteps;

fn global_version(txn: &StoreTxn<'_>) -> Result<SchemaVersion> {
    txn.schema_version()?
        .ok_or_else(|| Error::StoreNotDeployed("global".into()))
}

/// Open a local store for writing, deploying it on first use
fn open_local(stores: &dyn StoreProvider, location: &ShardLocation) -> Result<Arc<MetaStore>> {
    let store = stores.local(location)?;
    if store.deploy(StoreKind::Local, schema::LOCAL_LATEST, Some(location))? {
        debug!("Deployed local store for {}", location);
    }
    let version = store
        .schema_version()?
        .ok_or_else(|| Error::StoreNotDeployed(location.to_string()))?;
    schema::check_local(&location.to_string(), version)?;
    Ok(store)
}

/// Open a local store for undo; `None` when the forward step cannot have
/// written to it
fn open_local_for_undo(
    stores: &dyn StoreProvider,
    location: &ShardLocation,
) -> Result<Option<Arc<MetaStore>>> {
    let store = stores.local(location)?;
    match store.schema_version()? {
        None => Ok(None),
        Some(version) => match schema::check_local(&location.to_string(), version) {
            Ok(()) => Ok(Some(store)),
            Err(e) => {
                warn!("Skipping undo on {}: {}", location, e);
                Ok(None)
            }
        },
    }
}

fn ensure_pending(txn: &StoreTxn<'_>, op: &StoreOperation) -> Result<()> {
    match txn.pending_operation(op.shard_map.id)? {
        Some(pending) if pending.id == op.id => Ok(()),
        _ => Err(Error::OperationDoesNotExist(op.id)),
    }
}

impl OperationSteps for StoreSteps {
    fn global_pre_local(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        let global = stores.global()?;
        global.write(|txn| -> Result<()> {
            schema::check_global(global_version(txn)?, op.kind.required_global_version())?;
            op.kind.validate(&op.shard_map, txn)?;
            let mut record = op.to_record()?;
            record.state = OperationState::GlobalPreLocalExecuted;
            match txn.insert_pending(&record)? {
                None => Ok(()),
                Some(pending) => Err(Error::OperationPending {
                    shard_map: op.shard_map.name.clone(),
                    operation: pending.id,
                }),
            }
        })?;
        debug!("{} {}: global pre-local done", op.name(), op.id);
        Ok(())
    }

    fn local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        let Some(location) = op.kind.source_location() else {
            return Ok(());
        };
        let local = open_local(stores, location)?;
        local.write(|txn| op.kind.apply_source(&op.shard_map, txn))?;
        debug!("{} {}: local source {} done", op.name(), op.id, location);
        Ok(())
    }

    fn local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        let Some(location) = op.kind.target_location() else {
            return Ok(());
        };
        let local = open_local(stores, location)?;
        local.write(|txn| op.kind.apply_target(&op.shard_map, txn))?;
        debug!("{} {}: local target {} done", op.name(), op.id, location);
        Ok(())
    }

    fn global_post_local(
        &self,
        stores: &dyn StoreProvider,
        op: &StoreOperation,
    ) -> Result<OperationOutput> {
        let global = stores.global()?;
        let output = global.write(|txn| -> Result<OperationOutput> {
            schema::check_global(global_version(txn)?, op.kind.required_global_version())?;
            ensure_pending(txn, op)?;
            let output = op.kind.commit(&op.shard_map, txn)?;
            txn.remove_pending(&op.to_record()?)?;
            Ok(output)
        })?;
        debug!("{} {}: global post-local done", op.name(), op.id);
        Ok(output)
    }

    fn undo_local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        let Some(location) = op.kind.target_location() else {
            return Ok(());
        };
        if let Some(local) = open_local_for_undo(stores, location)? {
            local.write(|txn| op.kind.undo_target(txn))?;
        }
        debug!("{} {}: undo local target {} done", op.name(), op.id, location);
        Ok(())
    }

    fn undo_local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        let Some(location) = op.kind.source_location() else {
            return Ok(());
        };
        if let Some(local) = open_local_for_undo(stores, location)? {
            local.write(|txn| op.kind.undo_source(&op.shard_map, txn))?;
        }
        debug!("{} {}: undo local source {} done", op.name(), op.id, location);
        Ok(())
    }

    fn undo_global_pre_local(
        &self,
        stores: &dyn StoreProvider,
        op: &StoreOperation,
    ) -> Result<()> {
        let global = stores.global()?;
        global.write(|txn| -> Result<()> {
            txn.remove_pending(&op.to_record()?)?;
            Ok(())
        })?;
        debug!("{} {}: undo global pre-local done", op.name(), op.id);
        Ok(())
    }
}
