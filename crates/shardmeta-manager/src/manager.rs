//! Shard map manager: the public surface over the global and local stores.

use crate::operation::{
    OperationDriver, OperationKind, OperationOutput, OperationSteps, StoreOperation, StoreSteps,
};
use crate::retry::{DefaultFaultClassifier, FaultClassifier, RetryEvent, RetryPolicy};
use crate::schema::{self, SchemaVersionManager, UnlockScope, UpgradeScripts};
use shardmeta_common::config::PendingResolution;
use shardmeta_common::{
    Config, Error, Mapping, MappingId, MappingLockToken, MappingStatus, MappingUpdate,
    MAX_SHARD_MAP_NAME_LEN, OperationId, Result, SchemaVersion, Shard, ShardCreationInfo, ShardId,
    ShardLocation, ShardMap, ShardMapId, ShardMapKind, ShardRef, ShardUpdate, VersionStamp,
};
use shardmeta_key::{ShardKey, ShardKeyType, ShardRange};
use shardmeta_store::schema_info::encode_legacy;
use shardmeta_store::{
    OperationState, SchemaInfo, StoreKind, StoreProvider, StoreRead, StoreSnapshot,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::info;

/// Runtime settings of a [`ShardMapManager`]
#[derive(Clone, Debug, Default)]
pub struct ManagerConfig {
    pub retry: RetryPolicy,
    /// How a call resolves a pending operation it runs into
    pub pending_resolution: PendingResolution,
}

impl From<&Config> for ManagerConfig {
    fn from(config: &Config) -> Self {
        Self {
            retry: RetryPolicy::from(&config.retry),
            pending_resolution: config.recovery.pending_resolution,
        }
    }
}

pub struct ShardMapManager {
    stores: Arc<dyn StoreProvider>,
    driver: OperationDriver,
    versions: SchemaVersionManager,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::invalid_argument("shard map name must not be empty"));
    }
    if name.chars().count() > MAX_SHARD_MAP_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "shard map name exceeds {MAX_SHARD_MAP_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn check_version_arg(kind: StoreKind, version: SchemaVersion) -> Result<()> {
    let latest = schema::latest(kind);
    if version.major != schema::CURRENT_MAJOR || version > latest {
        return Err(Error::invalid_argument(format!(
            "unknown {kind} store version {version}, latest is {latest}"
        )));
    }
    Ok(())
}

fn check_owner(map: &ShardMap, shard: &Shard) -> Result<()> {
    if shard.shard_map_id != map.id {
        return Err(Error::invalid_argument(format!(
            "shard {} does not belong to shard map {}",
            shard.location, map.name
        )));
    }
    Ok(())
}

fn require_map(snap: &StoreSnapshot, map: &ShardMap) -> Result<ShardMap> {
    snap.shard_map(map.id)?
        .ok_or_else(|| Error::ShardMapDoesNotExist(map.name.clone()))
}

impl ShardMapManager {
    pub fn new(stores: Arc<dyn StoreProvider>, config: ManagerConfig) -> Self {
        let driver = OperationDriver::new(
            Arc::clone(&stores),
            Arc::new(StoreSteps),
            Arc::new(DefaultFaultClassifier),
            config.retry,
            config.pending_resolution,
        );
        Self {
            stores,
            driver,
            versions: SchemaVersionManager::default(),
        }
    }

    /// Replace the step implementation, e.g. with a [`crate::FaultInjector`]
    #[must_use]
    pub fn with_steps(mut self, steps: Arc<dyn OperationSteps>) -> Self {
        self.driver.set_steps(steps);
        self
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: Arc<dyn FaultClassifier>) -> Self {
        self.driver.set_classifier(classifier);
        self
    }

    #[must_use]
    pub fn with_upgrade_scripts(mut self, scripts: Arc<dyn UpgradeScripts>) -> Self {
        self.versions = SchemaVersionManager::new(scripts);
        self
    }

    /// Observe every failed attempt of a store call
    pub fn on_retry(&self, callback: impl Fn(&RetryEvent) + Send + Sync + 'static) {
        self.driver.on_retry(Arc::new(callback));
    }

    fn read_global<T>(
        &self,
        operation: &str,
        f: impl Fn(&StoreSnapshot) -> Result<T>,
    ) -> Result<T> {
        self.driver.with_retry(operation, |_| {
            let global = self.stores.global()?;
            global.read(|snap| {
                let version = snap
                    .schema_version()?
                    .ok_or_else(|| Error::StoreNotDeployed("global".into()))?;
                schema::check_global(version, schema::GLOBAL_INITIAL)?;
                f(snap)
            })
        })
    }

    fn execute(&self, shard_map: &ShardMap, kind: OperationKind) -> Result<OperationOutput> {
        self.driver
            .execute(StoreOperation::new(shard_map.clone(), kind))
    }

    // ---- Store deployment and versions ----

    /// Deploy the global store at `version` (latest when `None`).
    ///
    /// Returns the store's version; an already deployed store is untouched.
    pub fn deploy_global_store(&self, version: Option<SchemaVersion>) -> Result<SchemaVersion> {
        let version = version.unwrap_or(schema::GLOBAL_LATEST);
        check_version_arg(StoreKind::Global, version)?;
        self.driver.with_retry("DeployGlobalStore", |_| {
            let global = self.stores.global()?;
            if global.deploy(StoreKind::Global, version, None)? {
                info!("Deployed global store at {}", version);
            }
            global
                .schema_version()?
                .ok_or_else(|| Error::StoreNotDeployed("global".into()))
        })
    }

    pub fn deploy_local_store(
        &self,
        location: &ShardLocation,
        version: Option<SchemaVersion>,
    ) -> Result<SchemaVersion> {
        let version = version.unwrap_or(schema::LOCAL_LATEST);
        check_version_arg(StoreKind::Local, version)?;
        self.driver.with_retry("DeployLocalStore", |_| {
            let local = self.stores.local(location)?;
            if local.deploy(StoreKind::Local, version, Some(location))? {
                info!("Deployed local store {} at {}", location, version);
            }
            local
                .schema_version()?
                .ok_or_else(|| Error::StoreNotDeployed(location.to_string()))
        })
    }

    pub fn global_store_version(&self) -> Result<Option<SchemaVersion>> {
        self.driver.with_retry("GetGlobalStoreVersion", |_| {
            Ok(self.stores.global()?.schema_version()?)
        })
    }

    pub fn local_store_version(&self, location: &ShardLocation) -> Result<Option<SchemaVersion>> {
        self.driver.with_retry("GetLocalStoreVersion", |_| {
            Ok(self.stores.local(location)?.schema_version()?)
        })
    }

    /// Upgrade the global store to `target` (latest when `None`)
    pub fn upgrade_global_store(&self, target: Option<SchemaVersion>) -> Result<SchemaVersion> {
        self.driver.with_retry("UpgradeGlobalStore", |_| {
            let global = self.stores.global()?;
            self.versions.upgrade(&global, StoreKind::Global, target)
        })
    }

    /// Upgrade one shard's local store, independently of every other store
    pub fn upgrade_local_store(
        &self,
        location: &ShardLocation,
        target: Option<SchemaVersion>,
    ) -> Result<SchemaVersion> {
        self.driver.with_retry("UpgradeLocalStore", |_| {
            let local = self.stores.local(location)?;
            self.versions.upgrade(&local, StoreKind::Local, target)
        })
    }

    // ---- Shard maps ----

    pub fn create_list_shard_map(&self, name: &str, key_type: ShardKeyType) -> Result<ShardMap> {
        self.create_shard_map(name, ShardMapKind::List, key_type)
    }

    pub fn create_range_shard_map(&self, name: &str, key_type: ShardKeyType) -> Result<ShardMap> {
        self.create_shard_map(name, ShardMapKind::Range, key_type)
    }

    fn create_shard_map(
        &self,
        name: &str,
        kind: ShardMapKind,
        key_type: ShardKeyType,
    ) -> Result<ShardMap> {
        validate_name(name)?;
        let map = ShardMap::new(name, kind, key_type);
        self.execute(&map, OperationKind::CreateShardMap)?
            .into_shard_map()
    }

    pub fn get_shard_map(&self, name: &str) -> Result<ShardMap> {
        self.try_get_shard_map(name)?
            .ok_or_else(|| Error::ShardMapDoesNotExist(name.to_string()))
    }

    pub fn try_get_shard_map(&self, name: &str) -> Result<Option<ShardMap>> {
        validate_name(name)?;
        self.read_global("GetShardMap", |snap| Ok(snap.shard_map_by_name(name)?))
    }

    pub fn get_shard_maps(&self) -> Result<Vec<ShardMap>> {
        self.read_global("GetShardMaps", |snap| Ok(snap.shard_maps()?))
    }

    /// Delete an empty shard map. The handle must carry the current version.
    pub fn delete_shard_map(&self, shard_map: &ShardMap) -> Result<()> {
        self.execute(shard_map, OperationKind::DeleteShardMap)?;
        Ok(())
    }

    // ---- Shards ----

    pub fn create_shard(
        &self,
        shard_map: &ShardMap,
        info: impl Into<ShardCreationInfo>,
    ) -> Result<Shard> {
        let info = info.into();
        let shard = Shard {
            id: ShardId::new(),
            shard_map_id: shard_map.id,
            location: info.location,
            status: info.status,
            version: VersionStamp::INITIAL,
        };
        self.execute(shard_map, OperationKind::AddShard { shard })?
            .into_shard()
    }

    pub fn get_shard(&self, shard_map: &ShardMap, location: &ShardLocation) -> Result<Shard> {
        self.read_global("GetShard", |snap| {
            require_map(snap, shard_map)?;
            snap.shard_by_location(shard_map.id, location)?
                .ok_or_else(|| Error::ShardDoesNotExist {
                    shard_map: shard_map.name.clone(),
                    location: location.to_string(),
                })
        })
    }

    pub fn get_shards(&self, shard_map: &ShardMap) -> Result<Vec<Shard>> {
        self.read_global("GetShards", |snap| {
            require_map(snap, shard_map)?;
            Ok(snap.shards(shard_map.id)?)
        })
    }

    pub fn update_shard(
        &self,
        shard_map: &ShardMap,
        shard: &Shard,
        update: ShardUpdate,
    ) -> Result<Shard> {
        check_owner(shard_map, shard)?;
        let mut updated = shard.clone();
        if let Some(status) = update.status {
            updated.status = status;
        }
        updated.version = shard.version.next();
        self.execute(
            shard_map,
            OperationKind::UpdateShard {
                original: shard.clone(),
                updated,
            },
        )?
        .into_shard()
    }

    /// Remove a shard that no mapping refers to
    pub fn delete_shard(&self, shard_map: &ShardMap, shard: &Shard) -> Result<()> {
        check_owner(shard_map, shard)?;
        self.execute(
            shard_map,
            OperationKind::RemoveShard {
                shard: shard.clone(),
            },
        )?;
        Ok(())
    }

    // ---- Mappings ----

    /// Map a single key of a list shard map to `shard`
    pub fn create_point_mapping(
        &self,
        shard_map: &ShardMap,
        key: ShardKey,
        shard: &Shard,
    ) -> Result<Mapping> {
        if shard_map.kind != ShardMapKind::List {
            return Err(Error::invalid_argument(format!(
                "point mappings need a list shard map, {} is a range shard map",
                shard_map.name
            )));
        }
        key.expect_type(shard_map.key_type)?;
        if key.is_max() {
            return Err(Error::invalid_argument("cannot map the maximum sentinel key"));
        }
        self.add_mapping(shard_map, ShardRange::point(key)?, shard)
    }

    /// Map a key range of a range shard map to `shard`
    pub fn create_range_mapping(
        &self,
        shard_map: &ShardMap,
        range: ShardRange,
        shard: &Shard,
    ) -> Result<Mapping> {
        if shard_map.kind != ShardMapKind::Range {
            return Err(Error::invalid_argument(format!(
                "range mappings need a range shard map, {} is a list shard map",
                shard_map.name
            )));
        }
        range.low().expect_type(shard_map.key_type)?;
        self.add_mapping(shard_map, range, shard)
    }

    fn add_mapping(&self, shard_map: &ShardMap, range: ShardRange, shard: &Shard) -> Result<Mapping> {
        check_owner(shard_map, shard)?;
        let mapping = Mapping {
            id: MappingId::new(),
            shard_map_id: shard_map.id,
            range,
            shard: ShardRef::from(shard),
            status: MappingStatus::Online,
            version: VersionStamp::INITIAL,
            lock_owner: MappingLockToken::NO_LOCK,
        };
        self.execute(shard_map, OperationKind::AddMapping { mapping })?
            .into_mapping()
    }

    /// Mappings of a shard map in key order
    pub fn get_mappings(&self, shard_map: &ShardMap) -> Result<Vec<Mapping>> {
        self.read_global("GetMappings", |snap| {
            require_map(snap, shard_map)?;
            Ok(snap.mappings(shard_map.id)?)
        })
    }

    pub fn get_mapping(&self, shard_map: &ShardMap, id: MappingId) -> Result<Mapping> {
        self.read_global("GetMapping", |snap| {
            require_map(snap, shard_map)?;
            snap.mapping(id)?
                .filter(|m| m.shard_map_id == shard_map.id)
                .ok_or_else(|| Error::MappingDoesNotExist {
                    shard_map: shard_map.name.clone(),
                    mapping: id,
                })
        })
    }

    /// Change the status or the shard of a mapping.
    ///
    /// Moving a mapping to another shard requires it to be offline.
    pub fn update_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        update: MappingUpdate,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        let mut updated = mapping.clone();
        if let Some(status) = update.status {
            updated.status = status;
        }
        if let Some(shard) = update.shard {
            check_owner(shard_map, &shard)?;
            updated.shard = ShardRef::from(&shard);
        }
        updated.version = mapping.version.next();
        self.execute(
            shard_map,
            OperationKind::UpdateMapping {
                original: mapping.clone(),
                updated,
                token,
            },
        )?
        .into_mapping()
    }

    /// Remove an offline mapping
    pub fn delete_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<()> {
        self.execute(
            shard_map,
            OperationKind::RemoveMapping {
                mapping: mapping.clone(),
                token,
            },
        )?;
        Ok(())
    }

    // ---- Locks ----

    pub fn lock_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        if token.is_reserved() {
            return Err(Error::invalid_argument(format!(
                "{token:?} cannot be used to take a lock"
            )));
        }
        self.execute(
            shard_map,
            OperationKind::LockMapping {
                mapping: mapping.clone(),
                token,
            },
        )?
        .into_mapping()
    }

    /// Release the lock held by `token`; `FORCE_UNLOCK` releases any owner
    pub fn unlock_mapping(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
        token: MappingLockToken,
    ) -> Result<Mapping> {
        if token == MappingLockToken::NO_LOCK {
            return Err(Error::invalid_argument("an unlock needs a lock token"));
        }
        self.execute(
            shard_map,
            OperationKind::UnlockMapping {
                mapping: mapping.clone(),
                token,
            },
        )?
        .into_mapping()
    }

    /// Release locks in bulk and return the released mappings.
    ///
    /// Which mappings are released depends on the global store version.
    pub fn unlock_mappings(
        &self,
        shard_map: &ShardMap,
        token: MappingLockToken,
    ) -> Result<Vec<Mapping>> {
        if token == MappingLockToken::NO_LOCK {
            return Err(Error::invalid_argument("an unlock needs a lock token"));
        }
        let version = self
            .global_store_version()?
            .ok_or_else(|| Error::StoreNotDeployed("global".into()))?;
        let scope = if token == MappingLockToken::FORCE_UNLOCK {
            Some(UnlockScope::AllMappings)
        } else {
            schema::unlock_scope(version)
        };
        let scope = scope.ok_or(Error::GlobalStoreVersionMismatch {
            store: version,
            required: schema::GLOBAL_LOCKS,
        })?;
        self.execute(shard_map, OperationKind::UnlockMappings { token, scope })?
            .into_mappings()
    }

    pub fn get_mapping_lock_owner(
        &self,
        shard_map: &ShardMap,
        mapping: &Mapping,
    ) -> Result<MappingLockToken> {
        Ok(self.get_mapping(shard_map, mapping.id)?.lock_owner)
    }

    // ---- Lookup ----

    pub fn get_mapping_for_key(&self, shard_map: &ShardMap, key: &ShardKey) -> Result<Mapping> {
        self.try_get_mapping_for_key(shard_map, key)?
            .ok_or_else(|| Error::MappingNotFoundForKey {
                shard_map: shard_map.name.clone(),
                key: key.to_string(),
            })
    }

    pub fn try_get_mapping_for_key(
        &self,
        shard_map: &ShardMap,
        key: &ShardKey,
    ) -> Result<Option<Mapping>> {
        key.expect_type(shard_map.key_type)?;
        self.read_global("GetMappingForKey", |snap| {
            require_map(snap, shard_map)?;
            Ok(snap.mapping_for_key(shard_map.id, key)?)
        })
    }

    /// Every distinct shard location across all shard maps.
    ///
    /// Shards are read one shard map at a time as the iterator advances.
    pub fn get_distinct_shard_locations(&self) -> Result<DistinctShardLocations<'_>> {
        let maps = self.get_shard_maps()?;
        Ok(DistinctShardLocations {
            manager: self,
            maps: maps.into_iter(),
            current: Vec::new().into_iter(),
            seen: HashSet::new(),
        })
    }

    fn shards_of(&self, shard_map_id: ShardMapId) -> Result<Vec<Shard>> {
        self.read_global("GetShards", |snap| Ok(snap.shards(shard_map_id)?))
    }

    // ---- Schema info ----

    /// Attach table metadata to a shard map, replacing any previous value
    pub fn set_schema_info(&self, shard_map_name: &str, info: &SchemaInfo) -> Result<()> {
        validate_name(shard_map_name)?;
        self.driver.with_retry("SetSchemaInfo", |_| {
            let global = self.stores.global()?;
            global.write(|txn| -> Result<()> {
                let version = txn
                    .schema_version()?
                    .ok_or_else(|| Error::StoreNotDeployed("global".into()))?;
                schema::check_global(version, schema::GLOBAL_INITIAL)?;
                if txn.shard_map_by_name(shard_map_name)?.is_none() {
                    return Err(Error::ShardMapDoesNotExist(shard_map_name.to_string()));
                }
                let blob = if schema::uses_legacy_schema_info(version) {
                    encode_legacy(info)
                } else {
                    info.encode()
                }
                .map_err(|e| Error::Serialization(e.to_string()))?;
                txn.put_schema_info(shard_map_name, &blob)?;
                Ok(())
            })
        })
    }

    pub fn get_schema_info(&self, shard_map_name: &str) -> Result<Option<SchemaInfo>> {
        validate_name(shard_map_name)?;
        let blob = self.read_global("GetSchemaInfo", |snap| {
            Ok(snap.schema_info(shard_map_name)?)
        })?;
        blob.map(|blob| {
            SchemaInfo::decode(&blob).map_err(|e| {
                Error::Serialization(format!("schema info of {shard_map_name}: {e}"))
            })
        })
        .transpose()
    }

    // ---- Recovery ----

    /// Operations left pending by interrupted calls
    pub fn pending_operations(&self) -> Result<Vec<StoreOperation>> {
        self.driver
            .with_retry("GetPendingOperations", |_| self.driver.pending_operations())
    }

    pub fn resolve_pending_operation(
        &self,
        id: OperationId,
        resolution: PendingResolution,
    ) -> Result<OperationState> {
        self.driver.resolve_pending_operation(id, resolution)
    }
}

/// Lazy, deduplicated sequence of shard locations
pub struct DistinctShardLocations<'a> {
    manager: &'a ShardMapManager,
    maps: std::vec::IntoIter<ShardMap>,
    current: std::vec::IntoIter<Shard>,
    seen: HashSet<ShardLocation>,
}

impl Iterator for DistinctShardLocations<'_> {
    type Item = Result<ShardLocation>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(shard) = self.current.next() {
                if self.seen.insert(shard.location.clone()) {
                    return Some(Ok(shard.location));
                }
                continue;
            }
            let map = self.maps.next()?;
            match self.manager.shards_of(map.id) {
                Ok(shards) => self.current = shards.into_iter(),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{FaultInjector, Step};
    use parking_lot::Mutex;
    use shardmeta_common::ShardStatus;
    use shardmeta_store::{DiskStoreProvider, MemoryStoreProvider};
    use tempfile::TempDir;

    fn key(v: i32) -> ShardKey {
        ShardKey::new(v).unwrap()
    }

    fn range(low: i32, high: i32) -> ShardRange {
        ShardRange::new(key(low), key(high)).unwrap()
    }

    fn location(db: &str) -> ShardLocation {
        ShardLocation::new("srv", db).unwrap()
    }

    fn config(max_attempts: u32) -> ManagerConfig {
        ManagerConfig {
            retry: RetryPolicy::no_delay(max_attempts),
            pending_resolution: PendingResolution::Undo,
        }
    }

    fn setup() -> (Arc<MemoryStoreProvider>, ShardMapManager) {
        let stores = Arc::new(MemoryStoreProvider::new());
        let manager = ShardMapManager::new(stores.clone(), config(3));
        manager.deploy_global_store(None).unwrap();
        (stores, manager)
    }

    fn setup_with_faults(
        max_attempts: u32,
    ) -> (
        Arc<MemoryStoreProvider>,
        Arc<FaultInjector<StoreSteps>>,
        ShardMapManager,
    ) {
        let stores = Arc::new(MemoryStoreProvider::new());
        let faults = Arc::new(FaultInjector::new(StoreSteps));
        let manager =
            ShardMapManager::new(stores.clone(), config(max_attempts)).with_steps(faults.clone());
        manager.deploy_global_store(None).unwrap();
        (stores, faults, manager)
    }

    fn local_shards(stores: &MemoryStoreProvider, loc: &ShardLocation) -> Vec<Shard> {
        let local = stores.local(loc).unwrap();
        local
            .read(|snap| -> MetaResult<_> {
                let mut out = Vec::new();
                for map in snap.shard_maps()? {
                    out.extend(snap.shards(map.id)?);
                }
                Ok(out)
            })
            .unwrap()
    }

    fn local_mappings(stores: &MemoryStoreProvider, loc: &ShardLocation) -> Vec<Mapping> {
        let local = stores.local(loc).unwrap();
        local
            .read(|snap| -> MetaResult<_> {
                let mut out = Vec::new();
                for map in snap.shard_maps()? {
                    out.extend(snap.mappings(map.id)?);
                }
                Ok(out)
            })
            .unwrap()
    }

    type MetaResult<T> = shardmeta_store::MetaStoreResult<T>;

    #[test]
    fn test_create_and_get_shard_map() {
        let (_, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        assert_eq!(manager.get_shard_map("Customer").unwrap(), map);
        assert!(manager.try_get_shard_map("Orders").unwrap().is_none());
        assert!(matches!(
            manager.create_list_shard_map("Customer", ShardKeyType::Int64),
            Err(Error::ShardMapAlreadyExists(_))
        ));
        assert_eq!(manager.get_shard_maps().unwrap().len(), 1);
    }

    #[test]
    fn test_shard_map_name_validation() {
        let (_, manager) = setup();
        assert!(matches!(
            manager.create_list_shard_map("  ", ShardKeyType::Int32),
            Err(Error::InvalidArgument(_))
        ));
        let long = "x".repeat(MAX_SHARD_MAP_NAME_LEN + 1);
        assert!(matches!(
            manager.create_list_shard_map(&long, ShardKeyType::Int32),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_undeployed_store_is_reported() {
        let manager = ShardMapManager::new(Arc::new(MemoryStoreProvider::new()), config(1));
        assert!(matches!(
            manager.get_shard_maps(),
            Err(Error::StoreNotDeployed(_))
        ));
        assert!(matches!(
            manager.create_list_shard_map("m", ShardKeyType::Int32),
            Err(Error::StoreNotDeployed(_))
        ));
    }

    #[test]
    fn test_stale_handle_after_delete() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let stale = map.clone();
        manager.create_shard(&map, location("db1")).unwrap();

        let current = manager.get_shard_map("Customer").unwrap();
        manager.delete_shard_map(&current).unwrap();

        assert!(matches!(
            manager.create_shard(&stale, location("db2")),
            Err(Error::ShardMapDoesNotExist(_))
        ));
        assert!(matches!(
            manager.get_shards(&stale),
            Err(Error::ShardMapDoesNotExist(_))
        ));
        assert!(matches!(
            manager.get_shard_map("Customer"),
            Err(Error::ShardMapDoesNotExist(_))
        ));
    }

    #[test]
    fn test_delete_with_stale_version_is_rejected() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        manager.create_shard(&map, location("db1")).unwrap();
        assert!(matches!(
            manager.delete_shard_map(&map),
            Err(Error::ShardMapVersionMismatch(_))
        ));
    }

    #[test]
    fn test_delete_shard_map_with_mappings_is_rejected() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        manager.create_point_mapping(&map, key(1), &shard).unwrap();
        let current = manager.get_shard_map("Customer").unwrap();
        assert!(matches!(
            manager.delete_shard_map(&current),
            Err(Error::ShardMapHasMappings(_))
        ));
    }

    #[test]
    fn test_shard_lifecycle() {
        let (stores, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let loc = location("db1");
        let shard = manager.create_shard(&map, loc.clone()).unwrap();
        assert_eq!(manager.get_shard(&map, &loc).unwrap(), shard);
        assert_eq!(local_shards(&stores, &loc), vec![shard.clone()]);
        assert!(matches!(
            manager.create_shard(&map, loc.clone()),
            Err(Error::ShardLocationAlreadyExists { .. })
        ));

        let offline = manager
            .update_shard(
                &map,
                &shard,
                ShardUpdate {
                    status: Some(ShardStatus::Offline),
                },
            )
            .unwrap();
        assert_eq!(offline.status, ShardStatus::Offline);
        assert!(offline.version > shard.version);
        assert_eq!(local_shards(&stores, &loc), vec![offline.clone()]);

        // The old version no longer applies
        assert!(matches!(
            manager.update_shard(&map, &shard, ShardUpdate::default()),
            Err(Error::ShardVersionMismatch { .. })
        ));

        manager.delete_shard(&map, &offline).unwrap();
        assert!(manager.get_shards(&map).unwrap().is_empty());
        assert!(local_shards(&stores, &loc).is_empty());
        assert!(matches!(
            manager.get_shard(&map, &loc),
            Err(Error::ShardDoesNotExist { .. })
        ));
    }

    #[test]
    fn test_shard_with_mappings_cannot_be_deleted() {
        let (_, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        manager
            .create_range_mapping(&map, range(0, 10), &shard)
            .unwrap();
        assert!(matches!(
            manager.delete_shard(&map, &shard),
            Err(Error::ShardHasMappings { .. })
        ));
    }

    #[test]
    fn test_range_mappings_and_lookup() {
        let (stores, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let loc = location("db1");
        let shard = manager.create_shard(&map, loc.clone()).unwrap();
        let low = manager
            .create_range_mapping(&map, range(0, 100), &shard)
            .unwrap();
        let open_ended = ShardRange::new(key(100), ShardKey::max(ShardKeyType::Int32)).unwrap();
        let high = manager
            .create_range_mapping(&map, open_ended, &shard)
            .unwrap();

        assert_eq!(manager.get_mapping_for_key(&map, &key(0)).unwrap(), low);
        assert_eq!(manager.get_mapping_for_key(&map, &key(99)).unwrap(), low);
        assert_eq!(manager.get_mapping_for_key(&map, &key(100)).unwrap(), high);
        assert_eq!(
            manager.get_mapping_for_key(&map, &key(i32::MAX)).unwrap(),
            high
        );
        assert!(manager.try_get_mapping_for_key(&map, &key(-1)).unwrap().is_none());
        assert!(matches!(
            manager.get_mapping_for_key(&map, &key(-1)),
            Err(Error::MappingNotFoundForKey { .. })
        ));
        assert_eq!(manager.get_mappings(&map).unwrap(), vec![low.clone(), high]);
        assert_eq!(local_mappings(&stores, &loc).len(), 2);

        assert!(matches!(
            manager.create_range_mapping(&map, range(50, 150), &shard),
            Err(Error::MappingRangeAlreadyMapped { .. })
        ));
        assert!(matches!(
            manager.get_mapping_for_key(&map, &ShardKey::new(5_i64).unwrap()),
            Err(Error::Key(_))
        ));
    }

    #[test]
    fn test_point_mappings() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        let point = manager.create_point_mapping(&map, key(7), &shard).unwrap();
        assert_eq!(point.point(), Some(&key(7)));
        assert_eq!(manager.get_mapping_for_key(&map, &key(7)).unwrap(), point);
        assert!(manager.try_get_mapping_for_key(&map, &key(8)).unwrap().is_none());
        assert!(matches!(
            manager.create_point_mapping(&map, key(7), &shard),
            Err(Error::MappingPointAlreadyMapped { .. })
        ));
        assert!(matches!(
            manager.create_range_mapping(&map, range(0, 5), &shard),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_mapping_on_unknown_shard_is_rejected() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        manager.delete_shard(&map, &shard).unwrap();
        assert!(matches!(
            manager.create_point_mapping(&map, key(1), &shard),
            Err(Error::ShardDoesNotExist { .. })
        ));
    }

    #[test]
    fn test_update_and_delete_mapping() {
        let (stores, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let (loc1, loc2) = (location("db1"), location("db2"));
        let shard1 = manager.create_shard(&map, loc1.clone()).unwrap();
        let shard2 = manager.create_shard(&map, loc2.clone()).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 10), &shard1)
            .unwrap();

        // Moving an online mapping is refused
        let move_to_2 = MappingUpdate {
            status: None,
            shard: Some(shard2.clone()),
        };
        assert!(matches!(
            manager.update_mapping(&map, &mapping, move_to_2.clone(), MappingLockToken::NO_LOCK),
            Err(Error::MappingIsNotOffline { .. })
        ));
        assert!(matches!(
            manager.delete_mapping(&map, &mapping, MappingLockToken::NO_LOCK),
            Err(Error::MappingIsNotOffline { .. })
        ));

        let offline = manager
            .update_mapping(
                &map,
                &mapping,
                MappingUpdate {
                    status: Some(MappingStatus::Offline),
                    shard: None,
                },
                MappingLockToken::NO_LOCK,
            )
            .unwrap();
        assert_eq!(offline.status, MappingStatus::Offline);

        let moved = manager
            .update_mapping(&map, &offline, move_to_2, MappingLockToken::NO_LOCK)
            .unwrap();
        assert_eq!(moved.shard.id, shard2.id);
        assert!(local_mappings(&stores, &loc1).is_empty());
        assert_eq!(local_mappings(&stores, &loc2), vec![moved.clone()]);

        assert!(matches!(
            manager.update_mapping(&map, &offline, MappingUpdate::default(), MappingLockToken::NO_LOCK),
            Err(Error::MappingVersionMismatch { .. })
        ));

        manager
            .delete_mapping(&map, &moved, MappingLockToken::NO_LOCK)
            .unwrap();
        assert!(manager.get_mappings(&map).unwrap().is_empty());
        assert!(local_mappings(&stores, &loc2).is_empty());
    }

    #[test]
    fn test_lock_and_unlock_mapping() {
        let (_, manager) = setup();
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 10), &shard)
            .unwrap();
        let owner = MappingLockToken::new();
        let other = MappingLockToken::new();

        assert!(matches!(
            manager.lock_mapping(&map, &mapping, MappingLockToken::NO_LOCK),
            Err(Error::InvalidArgument(_))
        ));
        let locked = manager.lock_mapping(&map, &mapping, owner).unwrap();
        assert_eq!(manager.get_mapping_lock_owner(&map, &locked).unwrap(), owner);
        assert!(matches!(
            manager.lock_mapping(&map, &locked, other),
            Err(Error::MappingIsAlreadyLocked { .. })
        ));

        // Only the owner may change a locked mapping
        let offline = MappingUpdate {
            status: Some(MappingStatus::Offline),
            shard: None,
        };
        assert!(matches!(
            manager.update_mapping(&map, &locked, offline.clone(), other),
            Err(Error::MappingLockOwnerIdDoesNotMatch { .. })
        ));
        let updated = manager
            .update_mapping(&map, &locked, offline, owner)
            .unwrap();
        assert!(matches!(
            manager.unlock_mapping(&map, &updated, other),
            Err(Error::MappingLockOwnerIdDoesNotMatch { .. })
        ));

        let unlocked = manager.unlock_mapping(&map, &updated, owner).unwrap();
        assert_eq!(unlocked.lock_owner, MappingLockToken::NO_LOCK);
    }

    #[test]
    fn test_force_unlock() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        let mapping = manager.create_point_mapping(&map, key(1), &shard).unwrap();
        let locked = manager
            .lock_mapping(&map, &mapping, MappingLockToken::new())
            .unwrap();
        let unlocked = manager
            .unlock_mapping(&map, &locked, MappingLockToken::FORCE_UNLOCK)
            .unwrap();
        assert!(!unlocked.is_locked());
    }

    #[test]
    fn test_bulk_unlock_follows_store_version() {
        let stores = Arc::new(MemoryStoreProvider::new());
        let manager = ShardMapManager::new(stores, config(3));
        manager
            .deploy_global_store(Some(schema::GLOBAL_LOCKS))
            .unwrap();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        let ids: Vec<MappingId> = (1..=3)
            .map(|k| manager.create_point_mapping(&map, key(k), &shard).unwrap().id)
            .collect();
        let (t1, t2) = (MappingLockToken::new(), MappingLockToken::new());
        let lock_all = || {
            for (id, token) in ids.iter().zip([t1, t1, t2]) {
                let mapping = manager.get_mapping(&map, *id).unwrap();
                manager.lock_mapping(&map, &mapping, token).unwrap();
            }
        };
        let owners = || -> Vec<MappingLockToken> {
            ids.iter()
                .map(|id| manager.get_mapping(&map, *id).unwrap().lock_owner)
                .collect()
        };

        lock_all();
        let released = manager.unlock_mappings(&map, t2).unwrap();
        assert_eq!(released.len(), 3);
        assert_eq!(owners(), vec![MappingLockToken::NO_LOCK; 3]);

        assert_eq!(
            manager
                .upgrade_global_store(Some(schema::GLOBAL_OWNER_SCOPED_UNLOCK))
                .unwrap(),
            schema::GLOBAL_OWNER_SCOPED_UNLOCK
        );
        lock_all();
        let released = manager.unlock_mappings(&map, t1).unwrap();
        assert_eq!(released.len(), 2);
        assert_eq!(
            owners(),
            vec![MappingLockToken::NO_LOCK, MappingLockToken::NO_LOCK, t2]
        );
    }

    #[test]
    fn test_locks_need_upgraded_store() {
        let manager = ShardMapManager::new(Arc::new(MemoryStoreProvider::new()), config(3));
        manager
            .deploy_global_store(Some(schema::GLOBAL_INITIAL))
            .unwrap();
        let map = manager
            .create_list_shard_map("Orders", ShardKeyType::Int32)
            .unwrap();
        let shard = manager.create_shard(&map, location("db1")).unwrap();
        let mapping = manager.create_point_mapping(&map, key(1), &shard).unwrap();
        assert!(matches!(
            manager.lock_mapping(&map, &mapping, MappingLockToken::new()),
            Err(Error::GlobalStoreVersionMismatch { .. })
        ));
        assert!(matches!(
            manager.unlock_mappings(&map, MappingLockToken::new()),
            Err(Error::GlobalStoreVersionMismatch { .. })
        ));
        assert!(manager.pending_operations().unwrap().is_empty());
    }

    #[test]
    fn test_transient_commit_fault_is_retried_without_duplicates() {
        let (stores, faults, manager) = setup_with_faults(5);
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        manager.on_retry(move |e| recorded.lock().push(e.attempt));

        faults.fail_transient(Step::GlobalPostLocal, 3);
        let loc = location("db1");
        let shard = manager.create_shard(&map, loc.clone()).unwrap();

        assert_eq!(*events.lock(), vec![1, 2, 3]);
        assert_eq!(faults.calls(Step::GlobalPostLocal), 4);
        assert_eq!(manager.get_shards(&map).unwrap(), vec![shard.clone()]);
        assert_eq!(local_shards(&stores, &loc), vec![shard]);
        assert!(manager.pending_operations().unwrap().is_empty());
    }

    #[test]
    fn test_exhausted_commit_leaves_one_pending_operation() {
        let (stores, faults, manager) = setup_with_faults(3);
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let loc = location("db1");

        faults.fail_transient(Step::GlobalPostLocal, 3);
        let err = manager.create_shard(&map, loc.clone()).unwrap_err();
        assert!(matches!(err, Error::StorageOperationFailure { attempts: 3, .. }));

        let pending = manager.pending_operations().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, OperationState::LocalSourceExecuted);
        assert!(manager.get_shards(&map).unwrap().is_empty());
        assert_eq!(local_shards(&stores, &loc).len(), 1);

        // The next call undoes the leftover before applying its own change
        let loc2 = location("db2");
        let shard = manager.create_shard(&map, loc2.clone()).unwrap();
        assert!(manager.pending_operations().unwrap().is_empty());
        assert_eq!(manager.get_shards(&map).unwrap(), vec![shard]);
        assert!(local_shards(&stores, &loc).is_empty());
    }

    #[test]
    fn test_pending_operation_can_be_resumed() {
        let stores = Arc::new(MemoryStoreProvider::new());
        let faults = Arc::new(FaultInjector::new(StoreSteps));
        let manager = ShardMapManager::new(
            stores.clone(),
            ManagerConfig {
                retry: RetryPolicy::no_delay(2),
                pending_resolution: PendingResolution::Resume,
            },
        )
        .with_steps(faults.clone());
        manager.deploy_global_store(None).unwrap();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();

        faults.fail_transient(Step::GlobalPostLocal, 2);
        let loc = location("db1");
        assert!(manager.create_shard(&map, loc.clone()).is_err());

        let pending = manager.pending_operations().unwrap();
        assert_eq!(pending.len(), 1);
        let state = manager
            .resolve_pending_operation(pending[0].id, PendingResolution::Resume)
            .unwrap();
        assert_eq!(state, OperationState::GlobalPostLocalExecuted);
        assert_eq!(manager.get_shard(&map, &loc).unwrap().location, loc);
        assert!(manager.pending_operations().unwrap().is_empty());
        assert!(matches!(
            manager.resolve_pending_operation(pending[0].id, PendingResolution::Undo),
            Err(Error::OperationDoesNotExist(_))
        ));
    }

    #[test]
    fn test_implicit_resume_completes_leftover() {
        let stores = Arc::new(MemoryStoreProvider::new());
        let faults = Arc::new(FaultInjector::new(StoreSteps));
        let manager = ShardMapManager::new(
            stores.clone(),
            ManagerConfig {
                retry: RetryPolicy::no_delay(1),
                pending_resolution: PendingResolution::Resume,
            },
        )
        .with_steps(faults.clone());
        manager.deploy_global_store(None).unwrap();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();

        faults.fail_transient(Step::GlobalPostLocal, 1);
        assert!(manager.create_shard(&map, location("db1")).is_err());
        manager.create_shard(&map, location("db2")).unwrap();
        assert_eq!(manager.get_shards(&map).unwrap().len(), 2);
        assert!(manager.pending_operations().unwrap().is_empty());
    }

    #[test]
    fn test_fatal_local_fault_is_undone() {
        let (stores, faults, manager) = setup_with_faults(5);
        let map = manager
            .create_range_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let (loc1, loc2) = (location("db1"), location("db2"));
        let shard1 = manager.create_shard(&map, loc1.clone()).unwrap();
        let shard2 = manager.create_shard(&map, loc2.clone()).unwrap();
        let mapping = manager
            .create_range_mapping(&map, range(0, 10), &shard1)
            .unwrap();
        let offline = manager
            .update_mapping(
                &map,
                &mapping,
                MappingUpdate {
                    status: Some(MappingStatus::Offline),
                    shard: None,
                },
                MappingLockToken::NO_LOCK,
            )
            .unwrap();

        faults.fail_fatal(Step::LocalTarget, 1);
        let err = manager
            .update_mapping(
                &map,
                &offline,
                MappingUpdate {
                    status: None,
                    shard: Some(shard2),
                },
                MappingLockToken::NO_LOCK,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(faults.calls(Step::UndoLocalTarget), 1);
        assert_eq!(faults.calls(Step::UndoLocalSource), 1);
        assert_eq!(faults.calls(Step::UndoGlobalPreLocal), 1);

        assert!(manager.pending_operations().unwrap().is_empty());
        assert_eq!(manager.get_mappings(&map).unwrap(), vec![offline.clone()]);
        assert_eq!(local_mappings(&stores, &loc1), vec![offline]);
        assert!(local_mappings(&stores, &loc2).is_empty());
    }

    #[test]
    fn test_unavailable_local_store_is_transient() {
        let (stores, manager) = setup();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let loc = location("db1");
        stores.set_local_available(&loc, false);

        let attempts = Arc::new(Mutex::new(0));
        let counter = attempts.clone();
        manager.on_retry(move |_| *counter.lock() += 1);
        let err = manager.create_shard(&map, loc.clone()).unwrap_err();
        assert!(matches!(err, Error::StorageOperationFailure { .. }));
        assert!(err.root_cause().is_transient());
        assert_eq!(*attempts.lock(), 3);

        stores.set_local_available(&loc, true);
        manager.create_shard(&map, loc.clone()).unwrap();
        assert!(manager.pending_operations().unwrap().is_empty());
    }

    #[test]
    fn test_old_local_store_is_rejected() {
        let (_, manager) = setup();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();
        let loc = location("db1");
        manager
            .deploy_local_store(&loc, Some(schema::LOCAL_INITIAL))
            .unwrap();
        assert!(matches!(
            manager.create_shard(&map, loc.clone()),
            Err(Error::LocalStoreVersionMismatch { .. })
        ));
        assert!(manager.pending_operations().unwrap().is_empty());

        assert_eq!(
            manager.upgrade_local_store(&loc, None).unwrap(),
            schema::LOCAL_LATEST
        );
        manager.create_shard(&map, loc).unwrap();
    }

    #[test]
    fn test_store_versions() {
        let stores = Arc::new(MemoryStoreProvider::new());
        let manager = ShardMapManager::new(stores, config(1));
        assert_eq!(manager.global_store_version().unwrap(), None);
        assert_eq!(
            manager
                .deploy_global_store(Some(schema::GLOBAL_INITIAL))
                .unwrap(),
            schema::GLOBAL_INITIAL
        );
        // Deploying again leaves the version alone
        assert_eq!(
            manager.deploy_global_store(None).unwrap(),
            schema::GLOBAL_INITIAL
        );
        assert!(matches!(
            manager.deploy_global_store(Some(SchemaVersion::new(2, 0))),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(
            manager.upgrade_global_store(None).unwrap(),
            schema::GLOBAL_LATEST
        );
        // Upgrading to an older version is a no-op
        assert_eq!(
            manager
                .upgrade_global_store(Some(schema::GLOBAL_LOCKS))
                .unwrap(),
            schema::GLOBAL_LATEST
        );

        let (loc1, loc2) = (location("db1"), location("db2"));
        manager
            .deploy_local_store(&loc1, Some(schema::LOCAL_INITIAL))
            .unwrap();
        manager
            .deploy_local_store(&loc2, Some(schema::LOCAL_INITIAL))
            .unwrap();
        manager.upgrade_local_store(&loc1, None).unwrap();
        assert_eq!(
            manager.local_store_version(&loc1).unwrap(),
            Some(schema::LOCAL_LATEST)
        );
        assert_eq!(
            manager.local_store_version(&loc2).unwrap(),
            Some(schema::LOCAL_INITIAL)
        );
    }

    #[test]
    fn test_distinct_shard_locations() {
        let (_, manager) = setup();
        let a = manager
            .create_list_shard_map("A", ShardKeyType::Int32)
            .unwrap();
        let b = manager
            .create_range_shard_map("B", ShardKeyType::Int64)
            .unwrap();
        manager.create_shard(&a, location("db1")).unwrap();
        manager.create_shard(&a, location("db2")).unwrap();
        manager.create_shard(&b, location("db2")).unwrap();
        manager.create_shard(&b, location("db3")).unwrap();

        let mut locations: Vec<ShardLocation> = manager
            .get_distinct_shard_locations()
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        locations.sort();
        assert_eq!(
            locations,
            vec![location("db1"), location("db2"), location("db3")]
        );
    }

    #[test]
    fn test_schema_info_follows_store_version() {
        let stores = Arc::new(MemoryStoreProvider::new());
        let manager = ShardMapManager::new(stores.clone(), config(1));
        manager
            .deploy_global_store(Some(schema::GLOBAL_OWNER_SCOPED_UNLOCK))
            .unwrap();
        manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();

        let mut info = SchemaInfo::default();
        info.add_reference_table("dbo", "Regions");
        info.add_sharded_table("dbo", "Customers", "CustomerId");
        assert!(matches!(
            manager.set_schema_info("Orders", &info),
            Err(Error::ShardMapDoesNotExist(_))
        ));
        manager.set_schema_info("Customer", &info).unwrap();

        let raw = || {
            stores
                .global()
                .unwrap()
                .read(|snap| snap.schema_info("Customer"))
                .unwrap()
                .unwrap()
        };
        assert!(String::from_utf8(raw()).unwrap().contains("ShardedTableSet"));
        assert_eq!(manager.get_schema_info("Customer").unwrap(), Some(info.clone()));

        manager.upgrade_global_store(None).unwrap();
        assert!(String::from_utf8(raw()).unwrap().contains("sharded_tables"));
        assert_eq!(manager.get_schema_info("Customer").unwrap(), Some(info));
    }

    #[test]
    fn test_disk_stores_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let loc = location("db1");
        {
            let manager = ShardMapManager::new(
                Arc::new(DiskStoreProvider::new(dir.path())),
                config(1),
            );
            manager.deploy_global_store(None).unwrap();
            let map = manager
                .create_list_shard_map("Customer", ShardKeyType::Int32)
                .unwrap();
            let shard = manager.create_shard(&map, loc.clone()).unwrap();
            manager.create_point_mapping(&map, key(42), &shard).unwrap();
        }

        let manager =
            ShardMapManager::new(Arc::new(DiskStoreProvider::new(dir.path())), config(1));
        let map = manager.get_shard_map("Customer").unwrap();
        let mapping = manager.get_mapping_for_key(&map, &key(42)).unwrap();
        assert_eq!(mapping.shard.location, loc);
        assert_eq!(
            manager.local_store_version(&loc).unwrap(),
            Some(schema::LOCAL_LATEST)
        );
    }

    #[test]
    fn test_disk_shards_at_similar_locations_keep_own_stores() {
        let dir = TempDir::new().unwrap();
        let manager = ShardMapManager::new(Arc::new(DiskStoreProvider::new(dir.path())), config(1));
        manager.deploy_global_store(None).unwrap();
        let map = manager
            .create_list_shard_map("Customer", ShardKeyType::Int32)
            .unwrap();

        let locations = [
            ShardLocation::new("srv", "db_1").unwrap(),
            ShardLocation::new("srv_db", "1").unwrap(),
            ShardLocation::new("srv", "db").unwrap(),
            ShardLocation::with_protocol("srv", "db", shardmeta_common::ShardProtocol::Tcp, 0)
                .unwrap(),
        ];
        for (i, loc) in locations.iter().enumerate() {
            let shard = manager.create_shard(&map, loc.clone()).unwrap();
            let value = i32::try_from(i).unwrap();
            manager.create_point_mapping(&map, key(value), &shard).unwrap();
        }

        assert_eq!(manager.get_shards(&map).unwrap().len(), locations.len());
        drop(manager);
        let provider = DiskStoreProvider::new(dir.path());
        for (i, loc) in locations.iter().enumerate() {
            let local = provider.local(loc).unwrap();
            let shards = local
                .read(|snap| -> MetaResult<_> { snap.shards(map.id) })
                .unwrap();
            assert_eq!(shards.len(), 1);
            assert_eq!(&shards[0].location, loc);
            let mappings = local
                .read(|snap| -> MetaResult<_> { snap.mappings(map.id) })
                .unwrap();
            assert_eq!(mappings.len(), 1);
            assert_eq!(mappings[0].range.low(), &key(i32::try_from(i).unwrap()));
        }
    }
}
