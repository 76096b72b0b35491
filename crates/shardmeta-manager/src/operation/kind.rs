//! Per-kind preconditions and effects of store operations.
//!
//! Global effects are only written by `commit`, inside the same
//! transaction that removes the pending entry. Local effects are plain
//! overwrites or removals so repeating them is harmless.

use crate::schema::{self, UnlockScope};
use serde::{Deserialize, Serialize};
use shardmeta_common::{
    Error, Mapping, MappingLockToken, MappingStatus, Result, SchemaVersion, Shard, ShardLocation,
    ShardMap,
};
use shardmeta_store::{StoreRead, StoreTxn};

/// What a store operation changes, with the pre-images needed to undo it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    CreateShardMap,
    DeleteShardMap,
    AddShard {
        shard: Shard,
    },
    RemoveShard {
        shard: Shard,
    },
    UpdateShard {
        original: Shard,
        updated: Shard,
    },
    AddMapping {
        mapping: Mapping,
    },
    RemoveMapping {
        mapping: Mapping,
        token: MappingLockToken,
    },
    /// `updated` carries the post-commit version. When the shard changes the
    /// row moves from the source local store to the target one.
    UpdateMapping {
        original: Mapping,
        updated: Mapping,
        token: MappingLockToken,
    },
    LockMapping {
        mapping: Mapping,
        token: MappingLockToken,
    },
    UnlockMapping {
        mapping: Mapping,
        token: MappingLockToken,
    },
    UnlockMappings {
        token: MappingLockToken,
        scope: UnlockScope,
    },
}

/// Result of a committed operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationOutput {
    Unit,
    ShardMap(ShardMap),
    Shard(Shard),
    Mapping(Mapping),
    Mappings(Vec<Mapping>),
}

impl OperationOutput {
    pub fn into_shard_map(self) -> Result<ShardMap> {
        match self {
            Self::ShardMap(map) => Ok(map),
            other => Err(unexpected("shard map", &other)),
        }
    }

    pub fn into_shard(self) -> Result<Shard> {
        match self {
            Self::Shard(shard) => Ok(shard),
            other => Err(unexpected("shard", &other)),
        }
    }

    pub fn into_mapping(self) -> Result<Mapping> {
        match self {
            Self::Mapping(mapping) => Ok(mapping),
            other => Err(unexpected("mapping", &other)),
        }
    }

    pub fn into_mappings(self) -> Result<Vec<Mapping>> {
        match self {
            Self::Mappings(mappings) => Ok(mappings),
            other => Err(unexpected("mappings", &other)),
        }
    }
}

fn unexpected(expected: &str, output: &OperationOutput) -> Error {
    Error::internal(format!("expected {expected} output, got {output:?}"))
}

fn current_map(txn: &StoreTxn<'_>, handle: &ShardMap) -> Result<ShardMap> {
    txn.shard_map(handle.id)?
        .ok_or_else(|| Error::ShardMapDoesNotExist(handle.name.clone()))
}

fn bump_map(txn: &StoreTxn<'_>, handle: &ShardMap) -> Result<ShardMap> {
    let mut map = current_map(txn, handle)?;
    map.version = map.version.next();
    txn.put_shard_map(&map)?;
    Ok(map)
}

fn stored_shard(txn: &StoreTxn<'_>, handle: &ShardMap, shard: &Shard) -> Result<Shard> {
    txn.shard(handle.id, shard.id)?
        .filter(|stored| stored.location == shard.location)
        .ok_or_else(|| Error::ShardDoesNotExist {
            shard_map: handle.name.clone(),
            location: shard.location.to_string(),
        })
}

fn check_shard_version(handle: &ShardMap, stored: &Shard, presented: &Shard) -> Result<()> {
    if stored.version != presented.version {
        return Err(Error::ShardVersionMismatch {
            shard_map: handle.name.clone(),
            location: presented.location.to_string(),
        });
    }
    Ok(())
}

fn stored_mapping(txn: &StoreTxn<'_>, handle: &ShardMap, mapping: &Mapping) -> Result<Mapping> {
    txn.mapping(mapping.id)?
        .filter(|stored| stored.shard_map_id == handle.id)
        .ok_or_else(|| Error::MappingDoesNotExist {
            shard_map: handle.name.clone(),
            mapping: mapping.id,
        })
}

fn check_mapping_version(handle: &ShardMap, stored: &Mapping, presented: &Mapping) -> Result<()> {
    if stored.version != presented.version {
        return Err(Error::MappingVersionMismatch {
            shard_map: handle.name.clone(),
            mapping: presented.id,
        });
    }
    Ok(())
}

/// A locked mapping only changes for its owner
fn check_lock_owner(handle: &ShardMap, stored: &Mapping, token: MappingLockToken) -> Result<()> {
    if stored.is_locked() && stored.lock_owner != token {
        return Err(Error::MappingLockOwnerIdDoesNotMatch {
            shard_map: handle.name.clone(),
            mapping: stored.id,
        });
    }
    Ok(())
}

fn not_offline(handle: &ShardMap, mapping: &Mapping) -> Error {
    Error::MappingIsNotOffline {
        shard_map: handle.name.clone(),
        mapping: mapping.id,
    }
}

impl OperationKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateShardMap => "CreateShardMap",
            Self::DeleteShardMap => "DeleteShardMap",
            Self::AddShard { .. } => "AddShard",
            Self::RemoveShard { .. } => "RemoveShard",
            Self::UpdateShard { .. } => "UpdateShard",
            Self::AddMapping { .. } => "AddMapping",
            Self::RemoveMapping { .. } => "RemoveMapping",
            Self::UpdateMapping { .. } => "UpdateMapping",
            Self::LockMapping { .. } => "LockMapping",
            Self::UnlockMapping { .. } => "UnlockMapping",
            Self::UnlockMappings { .. } => "UnlockMappings",
        }
    }

    /// Oldest global store version able to run this operation
    #[must_use]
    pub const fn required_global_version(&self) -> SchemaVersion {
        match self {
            Self::LockMapping { .. } | Self::UnlockMapping { .. } | Self::UnlockMappings { .. } => {
                schema::GLOBAL_LOCKS
            }
            _ => schema::GLOBAL_INITIAL,
        }
    }

    /// Local store changed by the source step
    #[must_use]
    pub const fn source_location(&self) -> Option<&ShardLocation> {
        match self {
            Self::AddShard { shard } | Self::RemoveShard { shard } => Some(&shard.location),
            Self::UpdateShard { original, .. } => Some(&original.location),
            Self::AddMapping { mapping } | Self::RemoveMapping { mapping, .. } => {
                Some(&mapping.shard.location)
            }
            Self::UpdateMapping { original, .. } => Some(&original.shard.location),
            Self::CreateShardMap
            | Self::DeleteShardMap
            | Self::LockMapping { .. }
            | Self::UnlockMapping { .. }
            | Self::UnlockMappings { .. } => None,
        }
    }

    /// Local store changed by the target step, when the operation has one
    #[must_use]
    pub fn target_location(&self) -> Option<&ShardLocation> {
        match self {
            Self::UpdateMapping {
                original, updated, ..
            } if original.shard.id != updated.shard.id => Some(&updated.shard.location),
            _ => None,
        }
    }

    /// Check the preconditions against the global store
    pub fn validate(&self, handle: &ShardMap, txn: &StoreTxn<'_>) -> Result<()> {
        match self {
            Self::CreateShardMap => {
                if txn.shard_map_by_name(&handle.name)?.is_some()
                    || txn.shard_map(handle.id)?.is_some()
                {
                    return Err(Error::ShardMapAlreadyExists(handle.name.clone()));
                }
            }
            Self::DeleteShardMap => {
                let map = current_map(txn, handle)?;
                if map.version != handle.version {
                    return Err(Error::ShardMapVersionMismatch(handle.name.clone()));
                }
                if !txn.mappings(map.id)?.is_empty() {
                    return Err(Error::ShardMapHasMappings(handle.name.clone()));
                }
            }
            Self::AddShard { shard } => {
                current_map(txn, handle)?;
                if txn.shard_by_location(handle.id, &shard.location)?.is_some() {
                    return Err(Error::ShardLocationAlreadyExists {
                        shard_map: handle.name.clone(),
                        location: shard.location.to_string(),
                    });
                }
            }
            Self::RemoveShard { shard } => {
                current_map(txn, handle)?;
                let stored = stored_shard(txn, handle, shard)?;
                check_shard_version(handle, &stored, shard)?;
                if !txn.mappings_for_shard(handle.id, shard.id)?.is_empty() {
                    return Err(Error::ShardHasMappings {
                        shard_map: handle.name.clone(),
                        location: shard.location.to_string(),
                    });
                }
            }
            Self::UpdateShard { original, .. } => {
                current_map(txn, handle)?;
                let stored = stored_shard(txn, handle, original)?;
                check_shard_version(handle, &stored, original)?;
            }
            Self::AddMapping { mapping } => {
                current_map(txn, handle)?;
                let shard = txn.shard(handle.id, mapping.shard.id)?;
                if shard.is_none_or(|s| s.location != mapping.shard.location) {
                    return Err(Error::ShardDoesNotExist {
                        shard_map: handle.name.clone(),
                        location: mapping.shard.location.to_string(),
                    });
                }
                if !txn.overlapping_mappings(handle.id, &mapping.range)?.is_empty() {
                    return Err(if mapping.is_point() {
                        Error::MappingPointAlreadyMapped {
                            shard_map: handle.name.clone(),
                            key: mapping.range.low().to_string(),
                        }
                    } else {
                        Error::MappingRangeAlreadyMapped {
                            shard_map: handle.name.clone(),
                            range: mapping.range.to_string(),
                        }
                    });
                }
            }
            Self::RemoveMapping { mapping, token } => {
                current_map(txn, handle)?;
                let stored = stored_mapping(txn, handle, mapping)?;
                check_mapping_version(handle, &stored, mapping)?;
                check_lock_owner(handle, &stored, *token)?;
                if stored.status != MappingStatus::Offline {
                    return Err(not_offline(handle, &stored));
                }
            }
            Self::UpdateMapping {
                original,
                updated,
                token,
            } => {
                current_map(txn, handle)?;
                let stored = stored_mapping(txn, handle, original)?;
                check_mapping_version(handle, &stored, original)?;
                check_lock_owner(handle, &stored, *token)?;
                if updated.shard.id != stored.shard.id {
                    if stored.status != MappingStatus::Offline {
                        return Err(not_offline(handle, &stored));
                    }
                    let target = txn.shard(handle.id, updated.shard.id)?;
                    if target.is_none() {
                        return Err(Error::ShardDoesNotExist {
                            shard_map: handle.name.clone(),
                            location: updated.shard.location.to_string(),
                        });
                    }
                }
            }
            Self::LockMapping { mapping, .. } => {
                current_map(txn, handle)?;
                let stored = stored_mapping(txn, handle, mapping)?;
                check_mapping_version(handle, &stored, mapping)?;
                if stored.is_locked() {
                    return Err(Error::MappingIsAlreadyLocked {
                        shard_map: handle.name.clone(),
                        mapping: mapping.id,
                    });
                }
            }
            Self::UnlockMapping { mapping, token } => {
                current_map(txn, handle)?;
                let stored = stored_mapping(txn, handle, mapping)?;
                check_mapping_version(handle, &stored, mapping)?;
                if *token != MappingLockToken::FORCE_UNLOCK && stored.lock_owner != *token {
                    return Err(Error::MappingLockOwnerIdDoesNotMatch {
                        shard_map: handle.name.clone(),
                        mapping: mapping.id,
                    });
                }
            }
            Self::UnlockMappings { .. } => {
                current_map(txn, handle)?;
            }
        }
        Ok(())
    }

    /// Re-check the preconditions and write the global effect
    pub fn commit(&self, handle: &ShardMap, txn: &StoreTxn<'_>) -> Result<OperationOutput> {
        self.validate(handle, txn)?;
        let output = match self {
            Self::CreateShardMap => {
                txn.put_shard_map(handle)?;
                OperationOutput::ShardMap(handle.clone())
            }
            Self::DeleteShardMap => {
                txn.clear_shard_map_contents(handle.id)?;
                txn.remove_shard_map(handle)?;
                txn.remove_schema_info(&handle.name)?;
                OperationOutput::Unit
            }
            Self::AddShard { shard } => {
                txn.put_shard(shard)?;
                bump_map(txn, handle)?;
                OperationOutput::Shard(shard.clone())
            }
            Self::RemoveShard { shard } => {
                txn.remove_shard(handle.id, shard.id)?;
                bump_map(txn, handle)?;
                OperationOutput::Unit
            }
            Self::UpdateShard { updated, .. } => {
                txn.put_shard(updated)?;
                OperationOutput::Shard(updated.clone())
            }
            Self::AddMapping { mapping } => {
                txn.put_mapping(mapping)?;
                bump_map(txn, handle)?;
                OperationOutput::Mapping(mapping.clone())
            }
            Self::RemoveMapping { mapping, .. } => {
                txn.remove_mapping(mapping.id)?;
                bump_map(txn, handle)?;
                OperationOutput::Unit
            }
            Self::UpdateMapping { updated, .. } => {
                txn.put_mapping(updated)?;
                OperationOutput::Mapping(updated.clone())
            }
            Self::LockMapping { mapping, token } => {
                let mut locked = stored_mapping(txn, handle, mapping)?;
                locked.lock_owner = *token;
                locked.version = locked.version.next();
                txn.put_mapping(&locked)?;
                OperationOutput::Mapping(locked)
            }
            Self::UnlockMapping { mapping, .. } => {
                let mut unlocked = stored_mapping(txn, handle, mapping)?;
                unlocked.lock_owner = MappingLockToken::NO_LOCK;
                unlocked.version = unlocked.version.next();
                txn.put_mapping(&unlocked)?;
                OperationOutput::Mapping(unlocked)
            }
            Self::UnlockMappings { token, scope } => {
                let mut released = Vec::new();
                for mut mapping in txn.mappings(handle.id)? {
                    if scope.releases(mapping.lock_owner, *token) {
                        mapping.lock_owner = MappingLockToken::NO_LOCK;
                        mapping.version = mapping.version.next();
                        txn.put_mapping(&mapping)?;
                        released.push(mapping);
                    }
                }
                OperationOutput::Mappings(released)
            }
        };
        Ok(output)
    }

    /// Apply the change to the source local store
    pub fn apply_source(&self, handle: &ShardMap, txn: &StoreTxn<'_>) -> Result<()> {
        match self {
            Self::AddShard { shard } => {
                txn.put_shard_map(handle)?;
                txn.put_shard(shard)?;
            }
            Self::RemoveShard { shard } => {
                txn.remove_shard(handle.id, shard.id)?;
            }
            Self::UpdateShard { updated, .. } => txn.put_shard(updated)?,
            Self::AddMapping { mapping } => {
                txn.put_shard_map(handle)?;
                txn.put_mapping(mapping)?;
            }
            Self::RemoveMapping { mapping, .. } => {
                txn.remove_mapping(mapping.id)?;
            }
            Self::UpdateMapping {
                original, updated, ..
            } => {
                if self.target_location().is_some() {
                    txn.remove_mapping(original.id)?;
                } else {
                    txn.put_mapping(updated)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Revert `apply_source`
    pub fn undo_source(&self, handle: &ShardMap, txn: &StoreTxn<'_>) -> Result<()> {
        match self {
            Self::AddShard { shard } => {
                txn.remove_shard(handle.id, shard.id)?;
            }
            Self::RemoveShard { shard } => {
                txn.put_shard_map(handle)?;
                txn.put_shard(shard)?;
            }
            Self::UpdateShard { original, .. } => txn.put_shard(original)?,
            Self::AddMapping { mapping } => {
                txn.remove_mapping(mapping.id)?;
            }
            Self::RemoveMapping { mapping, .. } => {
                txn.put_shard_map(handle)?;
                txn.put_mapping(mapping)?;
            }
            Self::UpdateMapping { original, .. } => {
                txn.put_shard_map(handle)?;
                txn.put_mapping(original)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Apply the change to the target local store
    pub fn apply_target(&self, handle: &ShardMap, txn: &StoreTxn<'_>) -> Result<()> {
        if let Self::UpdateMapping { updated, .. } = self {
            txn.put_shard_map(handle)?;
            txn.put_mapping(updated)?;
        }
        Ok(())
    }

    /// Revert `apply_target`
    pub fn undo_target(&self, txn: &StoreTxn<'_>) -> Result<()> {
        if let Self::UpdateMapping { updated, .. } = self {
            txn.remove_mapping(updated.id)?;
        }
        Ok(())
    }
}
