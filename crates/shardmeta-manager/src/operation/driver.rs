//! Sequences the steps of a store operation under the retry policy.

use super::{OperationOutput, OperationSteps, StoreOperation};
use crate::retry::{FaultClassifier, FaultKind, RetryCallback, RetryEvent, RetryPolicy};
use parking_lot::RwLock;
use shardmeta_common::config::PendingResolution;
use shardmeta_common::{Error, OperationId, Result, ShardMapId};
use shardmeta_store::{OperationState, StoreProvider, StoreRead};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pending operations resolved on behalf of one call before giving up
const MAX_IMPLICIT_RESOLUTIONS: u32 = 8;

pub struct OperationDriver {
    stores: Arc<dyn StoreProvider>,
    steps: Arc<dyn OperationSteps>,
    classifier: Arc<dyn FaultClassifier>,
    policy: RetryPolicy,
    resolution: PendingResolution,
    callbacks: RwLock<Vec<RetryCallback>>,
}

impl OperationDriver {
    pub fn new(
        stores: Arc<dyn StoreProvider>,
        steps: Arc<dyn OperationSteps>,
        classifier: Arc<dyn FaultClassifier>,
        policy: RetryPolicy,
        resolution: PendingResolution,
    ) -> Self {
        Self {
            stores,
            steps,
            classifier,
            policy,
            resolution,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn set_steps(&mut self, steps: Arc<dyn OperationSteps>) {
        self.steps = steps;
    }

    pub fn set_classifier(&mut self, classifier: Arc<dyn FaultClassifier>) {
        self.classifier = classifier;
    }

    /// Register a callback invoked once per failed attempt
    pub fn on_retry(&self, callback: RetryCallback) {
        self.callbacks.write().push(callback);
    }

    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn notify(&self, event: &RetryEvent) {
        for callback in self.callbacks.read().iter() {
            callback(event);
        }
    }

    fn is_transient(&self, error: &Error) -> bool {
        self.classifier.classify(error) == FaultKind::Transient
    }

    /// Run `work` under the retry policy with the registered callbacks
    pub fn with_retry<T>(&self, operation: &str, work: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let on_retry = |event: &RetryEvent| self.notify(event);
        self.policy
            .run(operation, self.classifier.as_ref(), &on_retry, work)
    }

    /// Execute an operation to completion, retrying the whole step sequence
    /// on transient faults
    pub fn execute(&self, op: StoreOperation) -> Result<OperationOutput> {
        let mut op = op;
        info!("Executing {} {} on {}", op.name(), op.id, op.shard_map.name);
        self.with_retry(op.name(), |attempt| {
            op.attempts = attempt;
            op.state = OperationState::Created;
            self.run(&mut op)
        })
    }

    fn run(&self, op: &mut StoreOperation) -> Result<OperationOutput> {
        let stores = self.stores.as_ref();
        let mut resolved = 0;
        loop {
            match self.steps.global_pre_local(stores, op) {
                Ok(()) => break,
                Err(Error::OperationPending { operation, .. })
                    if operation != op.id && resolved < MAX_IMPLICIT_RESOLUTIONS =>
                {
                    resolved += 1;
                    info!(
                        "{} {} found pending operation {} on {}, resolving ({:?})",
                        op.name(),
                        op.id,
                        operation,
                        op.shard_map.name,
                        self.resolution
                    );
                    self.resolve_blocking(op.shard_map.id, operation)?;
                }
                Err(e) => {
                    if !self.is_transient(&e) {
                        self.abandon(op);
                    }
                    return Err(e);
                }
            }
        }
        op.state = OperationState::GlobalPreLocalExecuted;
        self.finish(op)
    }

    /// Run the forward steps; a fatal fault rolls the operation back
    fn finish(&self, op: &mut StoreOperation) -> Result<OperationOutput> {
        match self.forward(op) {
            Ok(output) => Ok(output),
            Err(e) if self.is_transient(&e) || matches!(e, Error::OperationDoesNotExist(_)) => {
                Err(e)
            }
            Err(e) => {
                warn!("{} {} failed at {}: {}, undoing", op.name(), op.id, op.state, e);
                if let Err(undo) = self.undo(op) {
                    warn!("Undo of {} {} failed: {}", op.name(), op.id, undo);
                }
                Err(e)
            }
        }
    }

    fn forward(&self, op: &mut StoreOperation) -> Result<OperationOutput> {
        let stores = self.stores.as_ref();
        if matches!(
            op.state,
            OperationState::Created | OperationState::GlobalPreLocalExecuted
        ) {
            self.steps.local_source(stores, op)?;
            self.advance(op, OperationState::LocalSourceExecuted)?;
        }
        if op.state == OperationState::LocalSourceExecuted && op.kind.target_location().is_some() {
            self.steps.local_target(stores, op)?;
            self.advance(op, OperationState::LocalTargetExecuted)?;
        }
        let output = self.steps.global_post_local(stores, op)?;
        op.state = OperationState::GlobalPostLocalExecuted;
        info!("{} {} committed", op.name(), op.id);
        Ok(output)
    }

    fn undo(&self, op: &mut StoreOperation) -> Result<()> {
        let stores = self.stores.as_ref();
        if !matches!(
            op.state,
            OperationState::UndoLocalSourceExecuted | OperationState::UndoGlobalPreLocalExecuted
        ) {
            if op.kind.target_location().is_some()
                && matches!(
                    op.state,
                    OperationState::LocalSourceExecuted | OperationState::LocalTargetExecuted
                )
            {
                self.steps.undo_local_target(stores, op)?;
                self.advance(op, OperationState::UndoLocalTargetExecuted)?;
            }
            self.steps.undo_local_source(stores, op)?;
            self.advance(op, OperationState::UndoLocalSourceExecuted)?;
        }
        self.steps.undo_global_pre_local(stores, op)?;
        op.state = OperationState::UndoGlobalPreLocalExecuted;
        info!("{} {} undone", op.name(), op.id);
        Ok(())
    }

    /// Move to `state`, recording it in the pending entry when the operation
    /// touches a local store
    fn advance(&self, op: &mut StoreOperation, state: OperationState) -> Result<()> {
        op.state = state;
        if op.kind.source_location().is_none() {
            return Ok(());
        }
        let record = op.to_record()?;
        let global = self.stores.global()?;
        global.write(|txn| -> Result<()> {
            match txn.pending_operation(record.shard_map_id)? {
                Some(pending) if pending.id == record.id => {
                    txn.update_pending(&record)?;
                    Ok(())
                }
                _ => Err(Error::OperationDoesNotExist(record.id)),
            }
        })
    }

    /// Roll back whatever an earlier attempt of `op` left pending
    fn abandon(&self, op: &StoreOperation) {
        let stored = self
            .stores
            .global()
            .map_err(Error::from)
            .and_then(|global| {
                global.read(|snap| -> Result<_> { Ok(snap.pending_operation(op.shard_map.id)?) })
            });
        match stored {
            Ok(Some(record)) if record.id == op.id => {
                let mut previous = op.clone();
                previous.state = record.state;
                if let Err(e) = self.undo(&mut previous) {
                    warn!("Undo of {} {} failed: {}", op.name(), op.id, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Could not check pending entry of {}: {}", op.id, e),
        }
    }

    fn resolve_blocking(&self, shard_map_id: ShardMapId, id: OperationId) -> Result<()> {
        let global = self.stores.global()?;
        let record =
            global.read(|snap| -> Result<_> { Ok(snap.pending_operation(shard_map_id)?) })?;
        match record {
            Some(record) if record.id == id => {
                self.resolve(StoreOperation::from_record(&record)?, self.resolution)?;
                Ok(())
            }
            // Resolved by someone else in the meantime
            _ => Ok(()),
        }
    }

    /// Resume or undo a pending operation, returning its final state.
    ///
    /// A record already on the undo path is always undone. A resume that
    /// fails fatally falls back to undo.
    pub fn resolve(
        &self,
        op: StoreOperation,
        resolution: PendingResolution,
    ) -> Result<OperationState> {
        let mut op = op;
        if op.state.is_undoing() || resolution == PendingResolution::Undo {
            self.undo(&mut op)?;
            return Ok(op.state);
        }
        match self.forward(&mut op) {
            Ok(_) => {
                info!("{} {} resumed to completion", op.name(), op.id);
                Ok(op.state)
            }
            Err(e) if self.is_transient(&e) || matches!(e, Error::OperationDoesNotExist(_)) => {
                Err(e)
            }
            Err(e) => {
                warn!("Resume of {} {} failed: {}, undoing", op.name(), op.id, e);
                self.undo(&mut op)?;
                Ok(op.state)
            }
        }
    }

    /// Outstanding pending operations across all shard maps
    pub fn pending_operations(&self) -> Result<Vec<StoreOperation>> {
        let global = self.stores.global()?;
        let records = global.read(|snap| -> Result<_> { Ok(snap.pending_operations()?) })?;
        records
            .iter()
            .map(|record| {
                StoreOperation::from_record(record).inspect_err(|e| {
                    error!("Unreadable pending operation {}: {}", record.id, e);
                })
            })
            .collect()
    }

    /// Resolve one pending operation by id under the retry policy
    pub fn resolve_pending_operation(
        &self,
        id: OperationId,
        resolution: PendingResolution,
    ) -> Result<OperationState> {
        self.with_retry("ResolvePendingOperation", |_| {
            let op = self
                .pending_operations()?
                .into_iter()
                .find(|op| op.id == id)
                .ok_or(Error::OperationDoesNotExist(id))?;
            self.resolve(op, resolution)
        })
    }
}
