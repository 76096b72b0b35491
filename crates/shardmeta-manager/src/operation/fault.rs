//! Fault injection around an [`OperationSteps`] implementation.

use super::{OperationOutput, OperationSteps, StoreOperation};
use parking_lot::Mutex;
use shardmeta_common::{Error, Result};
use shardmeta_store::StoreProvider;
use std::collections::HashMap;
use std::fmt;

/// One protocol step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    GlobalPreLocal,
    LocalSource,
    LocalTarget,
    GlobalPostLocal,
    UndoLocalTarget,
    UndoLocalSource,
    UndoGlobalPreLocal,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy)]
enum Fault {
    Transient,
    Fatal,
}

/// Fails chosen steps a fixed number of times before delegating to `S`.
///
/// A fault fires before the wrapped step runs, so the step has no effect on
/// the attempts that fail.
pub struct FaultInjector<S> {
    inner: S,
    faults: Mutex<HashMap<Step, (Fault, u32)>>,
    calls: Mutex<HashMap<Step, u32>>,
}

impl<S: OperationSteps> FaultInjector<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` runs of `step` with a retryable error
    pub fn fail_transient(&self, step: Step, times: u32) {
        self.faults.lock().insert(step, (Fault::Transient, times));
    }

    /// Fail the next `times` runs of `step` with a non-retryable error
    pub fn fail_fatal(&self, step: Step, times: u32) {
        self.faults.lock().insert(step, (Fault::Fatal, times));
    }

    /// Faults still armed for `step`
    pub fn remaining(&self, step: Step) -> u32 {
        self.faults.lock().get(&step).map_or(0, |(_, n)| *n)
    }

    /// How many times `step` was invoked, failed runs included
    pub fn calls(&self, step: Step) -> u32 {
        self.calls.lock().get(&step).copied().unwrap_or(0)
    }

    fn enter(&self, step: Step) -> Result<()> {
        *self.calls.lock().entry(step).or_insert(0) += 1;
        let mut faults = self.faults.lock();
        let Some((fault, remaining)) = faults.get_mut(&step) else {
            return Ok(());
        };
        if *remaining == 0 {
            return Ok(());
        }
        *remaining -= 1;
        Err(match fault {
            Fault::Transient => Error::StoreUnavailable(format!("injected fault at {step}")),
            Fault::Fatal => Error::Storage(format!("injected fault at {step}")),
        })
    }
}

impl<S: OperationSteps> OperationSteps for FaultInjector<S> {
    fn global_pre_local(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        self.enter(Step::GlobalPreLocal)?;
        self.inner.global_pre_local(stores, op)
    }

    fn local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        self.enter(Step::LocalSource)?;
        self.inner.local_source(stores, op)
    }

    fn local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        self.enter(Step::LocalTarget)?;
        self.inner.local_target(stores, op)
    }

    fn global_post_local(
        &self,
        stores: &dyn StoreProvider,
        op: &StoreOperation,
    ) -> Result<OperationOutput> {
        self.enter(Step::GlobalPostLocal)?;
        self.inner.global_post_local(stores, op)
    }

    fn undo_local_target(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        self.enter(Step::UndoLocalTarget)?;
        self.inner.undo_local_target(stores, op)
    }

    fn undo_local_source(&self, stores: &dyn StoreProvider, op: &StoreOperation) -> Result<()> {
        self.enter(Step::UndoLocalSource)?;
        self.inner.undo_local_source(stores, op)
    }

    fn undo_global_pre_local(
        &self,
        stores: &dyn StoreProvider,
        op: &StoreOperation,
    ) -> Result<()> {
        self.enter(Step::UndoGlobalPreLocal)?;
        self.inner.undo_global_pre_local(stores, op)
    }
}
