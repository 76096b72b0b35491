//! Store schema versions, upgrade steps and version-dependent behavior.

use shardmeta_common::{Error, MappingLockToken, Result, SchemaVersion};
use shardmeta_store::schema_info;
use shardmeta_store::{MetaStore, StoreKind, StoreRead, StoreTxn};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Major version this build understands
pub const CURRENT_MAJOR: u32 = 1;

pub const GLOBAL_INITIAL: SchemaVersion = SchemaVersion::new(1, 0);
/// Mapping locks
pub const GLOBAL_LOCKS: SchemaVersion = SchemaVersion::new(1, 1);
/// Bulk unlock only touches mappings owned by the token
pub const GLOBAL_OWNER_SCOPED_UNLOCK: SchemaVersion = SchemaVersion::new(1, 2);
/// Schema info blobs in the current tag form
pub const GLOBAL_SCHEMA_INFO_TAGS: SchemaVersion = SchemaVersion::new(1, 3);
pub const GLOBAL_LATEST: SchemaVersion = GLOBAL_SCHEMA_INFO_TAGS;

pub const LOCAL_INITIAL: SchemaVersion = SchemaVersion::new(1, 0);
/// Orphaned local mapping rows removed
pub const LOCAL_CLEAN_MAPPINGS: SchemaVersion = SchemaVersion::new(1, 1);
pub const LOCAL_LATEST: SchemaVersion = LOCAL_CLEAN_MAPPINGS;
/// Oldest local store the operation steps will write to
pub const LOCAL_MINIMUM: SchemaVersion = LOCAL_CLEAN_MAPPINGS;

#[must_use]
pub const fn latest(kind: StoreKind) -> SchemaVersion {
    match kind {
        StoreKind::Global => GLOBAL_LATEST,
        StoreKind::Local => LOCAL_LATEST,
    }
}

/// Which mappings a bulk unlock releases
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnlockScope {
    /// Every locked mapping in the shard map, whatever its owner
    AllMappings,
    /// Only mappings locked by the presented token
    OwnedByToken,
}

impl UnlockScope {
    #[must_use]
    pub fn releases(self, owner: MappingLockToken, token: MappingLockToken) -> bool {
        owner != MappingLockToken::NO_LOCK
            && match self {
                Self::AllMappings => true,
                Self::OwnedByToken => owner == token,
            }
    }
}

// Bulk unlock behavior by global version; each entry applies from its
// version up to the next entry.
const UNLOCK_BEHAVIOR: &[(SchemaVersion, UnlockScope)] = &[
    (GLOBAL_LOCKS, UnlockScope::AllMappings),
    (GLOBAL_OWNER_SCOPED_UNLOCK, UnlockScope::OwnedByToken),
];

/// Bulk unlock scope for a global store at `version`, `None` before locks
#[must_use]
pub fn unlock_scope(version: SchemaVersion) -> Option<UnlockScope> {
    UNLOCK_BEHAVIOR
        .iter()
        .rev()
        .find(|(from, _)| version >= *from)
        .map(|(_, scope)| *scope)
}

/// Whether schema info blobs are written in the pre-1.3 form
#[must_use]
pub fn uses_legacy_schema_info(version: SchemaVersion) -> bool {
    version < GLOBAL_SCHEMA_INFO_TAGS
}

/// Check that a global store at `store` can serve an operation needing `required`
pub fn check_global(store: SchemaVersion, required: SchemaVersion) -> Result<()> {
    if store.major != CURRENT_MAJOR || store < required {
        return Err(Error::GlobalStoreVersionMismatch { store, required });
    }
    Ok(())
}

pub fn check_local(location: &str, store: SchemaVersion) -> Result<()> {
    if store.major != CURRENT_MAJOR || store < LOCAL_MINIMUM {
        return Err(Error::LocalStoreVersionMismatch {
            location: location.to_string(),
            store,
            required: LOCAL_MINIMUM,
        });
    }
    Ok(())
}

/// One idempotent upgrade action moving a store from `from` to `to`
#[derive(Clone, Copy)]
pub struct UpgradeStep {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub description: &'static str,
    pub action: fn(&StoreTxn<'_>) -> Result<()>,
}

impl fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Source of upgrade steps
pub trait UpgradeScripts: Send + Sync {
    /// Ordered steps taking a store of `kind` from `from` up to `to`
    fn steps(&self, kind: StoreKind, from: SchemaVersion, to: SchemaVersion) -> Vec<UpgradeStep>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinUpgradeScripts;

const GLOBAL_STEPS: &[UpgradeStep] = &[
    UpgradeStep {
        from: GLOBAL_INITIAL,
        to: GLOBAL_LOCKS,
        description: "add mapping lock owners",
        action: backfill_lock_owners,
    },
    UpgradeStep {
        from: GLOBAL_LOCKS,
        to: GLOBAL_OWNER_SCOPED_UNLOCK,
        description: "scope bulk unlock to the lock owner",
        action: no_data_change,
    },
    UpgradeStep {
        from: GLOBAL_OWNER_SCOPED_UNLOCK,
        to: GLOBAL_SCHEMA_INFO_TAGS,
        description: "rename schema info tags",
        action: reencode_schema_info,
    },
];

const LOCAL_STEPS: &[UpgradeStep] = &[UpgradeStep {
    from: LOCAL_INITIAL,
    to: LOCAL_CLEAN_MAPPINGS,
    description: "drop mappings of missing shards",
    action: drop_orphaned_mappings,
}];

impl UpgradeScripts for BuiltinUpgradeScripts {
    fn steps(&self, kind: StoreKind, from: SchemaVersion, to: SchemaVersion) -> Vec<UpgradeStep> {
        let all = match kind {
            StoreKind::Global => GLOBAL_STEPS,
            StoreKind::Local => LOCAL_STEPS,
        };
        all.iter()
            .filter(|step| step.from >= from && step.to <= to)
            .copied()
            .collect()
    }
}

fn backfill_lock_owners(txn: &StoreTxn<'_>) -> Result<()> {
    let mut updated = 0;
    for map in txn.shard_maps()? {
        for mut mapping in txn.mappings(map.id)? {
            if mapping.lock_owner != MappingLockToken::NO_LOCK {
                mapping.lock_owner = MappingLockToken::NO_LOCK;
                txn.put_mapping(&mapping)?;
                updated += 1;
            }
        }
    }
    debug!("Backfilled lock owner on {} mappings", updated);
    Ok(())
}

const fn no_data_change(_txn: &StoreTxn<'_>) -> Result<()> {
    Ok(())
}

fn reencode_schema_info(txn: &StoreTxn<'_>) -> Result<()> {
    for (name, blob) in txn.schema_infos()? {
        let upgraded = schema_info::upgrade_blob(&blob)
            .map_err(|e| Error::Serialization(format!("schema info of '{name}': {e}")))?;
        if let Some(upgraded) = upgraded {
            txn.put_schema_info(&name, &upgraded)?;
        }
    }
    Ok(())
}

fn drop_orphaned_mappings(txn: &StoreTxn<'_>) -> Result<()> {
    for map in txn.shard_maps()? {
        for mapping in txn.mappings(map.id)? {
            if txn.shard(map.id, mapping.shard.id)?.is_none() {
                debug!("Dropping local mapping {} of missing shard", mapping.id);
                txn.remove_mapping(mapping.id)?;
            }
        }
    }
    Ok(())
}

/// Applies upgrade steps to global and local stores
pub struct SchemaVersionManager {
    scripts: Arc<dyn UpgradeScripts>,
}

impl Default for SchemaVersionManager {
    fn default() -> Self {
        Self::new(Arc::new(BuiltinUpgradeScripts))
    }
}

impl SchemaVersionManager {
    pub fn new(scripts: Arc<dyn UpgradeScripts>) -> Self {
        Self { scripts }
    }

    /// Upgrade `store` to `target` (latest when `None`), returning the
    /// resulting version. A store already at or above the target is left
    /// untouched.
    pub fn upgrade(
        &self,
        store: &MetaStore,
        kind: StoreKind,
        target: Option<SchemaVersion>,
    ) -> Result<SchemaVersion> {
        let current = store
            .schema_version()?
            .ok_or_else(|| Error::StoreNotDeployed(store.label().to_string()))?;
        let latest = latest(kind);
        let target = target.unwrap_or(latest);
        if target.major != current.major || current.major != CURRENT_MAJOR {
            return Err(version_mismatch(kind, store, current, target));
        }
        if target > latest {
            return Err(Error::invalid_argument(format!(
                "{kind} store version {target} is newer than the latest known {latest}"
            )));
        }
        if current >= target {
            debug!("{} store {} already at {}", kind, store.label(), current);
            return Ok(current);
        }

        for step in self.scripts.steps(kind, current, target) {
            store.write(|txn| -> Result<()> {
                let version = txn
                    .schema_version()?
                    .ok_or_else(|| Error::StoreNotDeployed(store.label().to_string()))?;
                if version >= step.to {
                    return Ok(());
                }
                if version != step.from {
                    return Err(Error::internal(format!(
                        "upgrade step {} -> {} applied to store at {version}",
                        step.from, step.to
                    )));
                }
                (step.action)(txn)?;
                txn.set_schema_version(step.to)?;
                Ok(())
            })?;
            info!(
                "Upgraded {} store {} to {} ({})",
                kind,
                store.label(),
                step.to,
                step.description
            );
        }
        let reached = store
            .schema_version()?
            .ok_or_else(|| Error::StoreNotDeployed(store.label().to_string()))?;
        Ok(reached)
    }
}

fn version_mismatch(
    kind: StoreKind,
    store: &MetaStore,
    current: SchemaVersion,
    target: SchemaVersion,
) -> Error {
    match kind {
        StoreKind::Global => Error::GlobalStoreVersionMismatch {
            store: current,
            required: target,
        },
        StoreKind::Local => Error::LocalStoreVersionMismatch {
            location: store.label().to_string(),
            store: current,
            required: target,
        },
    }
}
