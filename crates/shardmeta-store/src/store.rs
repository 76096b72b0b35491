//! Persistent metadata store backed by redb.
//!
//! Every mutation happens inside `MetaStore::write`, which commits when the
//! closure succeeds and aborts otherwise. `StoreTxn` and `StoreSnapshot`
//! expose typed per-table accessors; both implement `StoreRead`.

use crate::tables;
use crate::types::{StoreKind, StoredOperation};
use redb::{Database, ReadableTable, ReadableTableMetadata};
use serde::Serialize;
use serde::de::DeserializeOwned;
use shardmeta_common::{
    Error, Mapping, MappingId, SchemaVersion, Shard, ShardId, ShardLocation, ShardMap, ShardMapId,
};
use shardmeta_key::{ShardKey, ShardRange};
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

const META_VERSION: &str = "version";
const META_KIND: &str = "kind";
const META_LOCATION: &str = "location";

/// Error type for metadata store operations
#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("store {0} is unavailable")]
    Unavailable(String),
}

impl From<redb::TransactionError> for MetaStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type MetaStoreResult<T> = Result<T, MetaStoreError>;

fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
    )
}

fn is_transient_storage(e: &redb::StorageError) -> bool {
    match e {
        redb::StorageError::Io(io) => is_transient_io(io),
        _ => false,
    }
}

impl MetaStoreError {
    /// Whether the failure is a connectivity or contention fault that may
    /// succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Io(e) => is_transient_io(e),
            Self::Storage(e) => is_transient_storage(e),
            Self::Redb(redb::DatabaseError::DatabaseAlreadyOpen) => true,
            Self::Redb(redb::DatabaseError::Storage(e))
            | Self::Table(redb::TableError::Storage(e))
            | Self::Commit(redb::CommitError::Storage(e)) => is_transient_storage(e),
            Self::Transaction(e) => match e.as_ref() {
                redb::TransactionError::Storage(e) => is_transient_storage(e),
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<MetaStoreError> for Error {
    fn from(e: MetaStoreError) -> Self {
        if e.is_transient() {
            return Self::StoreUnavailable(e.to_string());
        }
        match e {
            MetaStoreError::Bincode(e) => Self::Serialization(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> MetaStoreResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> MetaStoreResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Key of a mapping row: shard map id followed by the raw low key
fn mapping_key(shard_map_id: ShardMapId, low: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(16 + low.len());
    key.extend_from_slice(shard_map_id.as_bytes());
    key.extend_from_slice(low);
    key
}

fn shard_key(shard_map_id: ShardMapId, shard_id: ShardId) -> String {
    format!("{shard_map_id}:{shard_id}")
}

fn shard_prefix(shard_map_id: ShardMapId) -> String {
    format!("{shard_map_id}:")
}

/// Persistent metadata store backed by redb.
pub struct MetaStore {
    db: Database,
    label: String,
}

impl std::fmt::Debug for MetaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaStore").field("label", &self.label).finish_non_exhaustive()
    }
}

impl MetaStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> MetaStoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;
        debug!("Opened metadata store at {}", path.display());
        Self::init(db, path.display().to_string())
    }

    /// Create a store that lives only in memory
    pub fn in_memory(label: impl Into<String>) -> MetaStoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db, label.into())
    }

    fn init(db: Database, label: String) -> MetaStoreResult<Self> {
        // Create all tables eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::SHARD_MAPS)?;
            let _t = write_txn.open_table(tables::SHARD_MAP_NAMES)?;
            let _t = write_txn.open_table(tables::SHARDS)?;
            let _t = write_txn.open_table(tables::MAPPINGS)?;
            let _t = write_txn.open_table(tables::MAPPING_INDEX)?;
            let _t = write_txn.open_table(tables::PENDING_OPERATIONS)?;
            let _t = write_txn.open_table(tables::SCHEMA_INFO)?;
            let _t = write_txn.open_table(tables::STORE_META)?;
        }
        write_txn.commit()?;
        Ok(Self { db, label })
    }

    /// Path or name this store was opened with
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run `f` in a write transaction, committing only if it succeeds
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreTxn<'_>) -> Result<T, E>,
        E: From<MetaStoreError>,
    {
        let txn = self.db.begin_write().map_err(MetaStoreError::from)?;
        let result = f(&StoreTxn { txn: &txn });
        match result {
            Ok(value) => {
                txn.commit().map_err(MetaStoreError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = txn.abort() {
                    warn!("Failed to abort transaction on {}: {}", self.label, abort);
                }
                Err(e)
            }
        }
    }

    /// Run `f` against a consistent read snapshot
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&StoreSnapshot) -> Result<T, E>,
        E: From<MetaStoreError>,
    {
        let txn = self.db.begin_read().map_err(MetaStoreError::from)?;
        f(&StoreSnapshot { txn })
    }

    /// Write the store identity and version if the store is not deployed yet.
    ///
    /// Returns whether anything was written.
    pub fn deploy(
        &self,
        kind: StoreKind,
        version: SchemaVersion,
        location: Option<&ShardLocation>,
    ) -> MetaStoreResult<bool> {
        self.write(|txn| {
            if txn.schema_version()?.is_some() {
                return Ok(false);
            }
            txn.set_identity(kind, location)?;
            txn.set_schema_version(version)?;
            debug!("Deployed {} store {} at version {}", kind, self.label, version);
            Ok(true)
        })
    }

    /// Schema version, or `None` if the store was never deployed
    pub fn schema_version(&self) -> MetaStoreResult<Option<SchemaVersion>> {
        self.read(StoreRead::schema_version)
    }
}

/// Read access shared by write transactions and read snapshots
pub trait StoreRead {
    fn schema_version(&self) -> MetaStoreResult<Option<SchemaVersion>>;
    fn store_kind(&self) -> MetaStoreResult<Option<StoreKind>>;
    /// Location a local store was deployed for
    fn store_location(&self) -> MetaStoreResult<Option<ShardLocation>>;

    fn shard_map(&self, id: ShardMapId) -> MetaStoreResult<Option<ShardMap>>;
    fn shard_map_by_name(&self, name: &str) -> MetaStoreResult<Option<ShardMap>>;
    fn shard_maps(&self) -> MetaStoreResult<Vec<ShardMap>>;

    fn shard(&self, shard_map_id: ShardMapId, id: ShardId) -> MetaStoreResult<Option<Shard>>;
    fn shards(&self, shard_map_id: ShardMapId) -> MetaStoreResult<Vec<Shard>>;

    fn mapping(&self, id: MappingId) -> MetaStoreResult<Option<Mapping>>;
    /// Mappings of a shard map in key order
    fn mappings(&self, shard_map_id: ShardMapId) -> MetaStoreResult<Vec<Mapping>>;
    /// The mapping whose range contains `key`
    fn mapping_for_key(
        &self,
        shard_map_id: ShardMapId,
        key: &ShardKey,
    ) -> MetaStoreResult<Option<Mapping>>;
    /// Mappings whose range intersects `range`, in key order
    fn overlapping_mappings(
        &self,
        shard_map_id: ShardMapId,
        range: &ShardRange,
    ) -> MetaStoreResult<Vec<Mapping>>;

    fn pending_operation(&self, shard_map_id: ShardMapId)
    -> MetaStoreResult<Option<StoredOperation>>;
    fn pending_operations(&self) -> MetaStoreResult<Vec<StoredOperation>>;

    fn schema_info(&self, shard_map_name: &str) -> MetaStoreResult<Option<Vec<u8>>>;
    fn schema_infos(&self) -> MetaStoreResult<Vec<(String, Vec<u8>)>>;

    fn shard_by_location(
        &self,
        shard_map_id: ShardMapId,
        location: &ShardLocation,
    ) -> MetaStoreResult<Option<Shard>> {
        Ok(self
            .shards(shard_map_id)?
            .into_iter()
            .find(|s| &s.location == location))
    }

    fn mappings_for_shard(
        &self,
        shard_map_id: ShardMapId,
        shard_id: ShardId,
    ) -> MetaStoreResult<Vec<Mapping>> {
        let mut mappings = self.mappings(shard_map_id)?;
        mappings.retain(|m| m.shard.id == shard_id);
        Ok(mappings)
    }
}

// Both transaction types expose `open_table` with the same shape, so the
// accessors are written once and expanded into each impl.
macro_rules! store_read_methods {
    () => {
        fn schema_version(&self) -> MetaStoreResult<Option<SchemaVersion>> {
            let table = self.txn.open_table(tables::STORE_META)?;
            table
                .get(META_VERSION)?
                .map(|v| decode(v.value()))
                .transpose()
        }

        fn store_kind(&self) -> MetaStoreResult<Option<StoreKind>> {
            let table = self.txn.open_table(tables::STORE_META)?;
            table.get(META_KIND)?.map(|v| decode(v.value())).transpose()
        }

        fn store_location(&self) -> MetaStoreResult<Option<ShardLocation>> {
            let table = self.txn.open_table(tables::STORE_META)?;
            table
                .get(META_LOCATION)?
                .map(|v| decode(v.value()))
                .transpose()
        }

        fn shard_map(&self, id: ShardMapId) -> MetaStoreResult<Option<ShardMap>> {
            let table = self.txn.open_table(tables::SHARD_MAPS)?;
            let key = id.to_string();
            table
                .get(key.as_str())?
                .map(|v| decode(v.value()))
                .transpose()
        }

        fn shard_map_by_name(&self, name: &str) -> MetaStoreResult<Option<ShardMap>> {
            let id = {
                let names = self.txn.open_table(tables::SHARD_MAP_NAMES)?;
                names.get(name)?.map(|id| id.value().to_string())
            };
            let Some(id) = id else {
                return Ok(None);
            };
            let id = uuid_from_str(&id, "shard_map_names")?;
            self.shard_map(ShardMapId::from_uuid(id))
        }

        fn shard_maps(&self) -> MetaStoreResult<Vec<ShardMap>> {
            let table = self.txn.open_table(tables::SHARD_MAPS)?;
            let mut result = Vec::with_capacity(usize::try_from(table.len()?).unwrap_or(0));
            for entry in table.iter()? {
                let (_, v) = entry?;
                result.push(decode(v.value())?);
            }
            Ok(result)
        }

        fn shard(&self, shard_map_id: ShardMapId, id: ShardId) -> MetaStoreResult<Option<Shard>> {
            let table = self.txn.open_table(tables::SHARDS)?;
            let key = shard_key(shard_map_id, id);
            table
                .get(key.as_str())?
                .map(|v| decode(v.value()))
                .transpose()
        }

        fn shards(&self, shard_map_id: ShardMapId) -> MetaStoreResult<Vec<Shard>> {
            let table = self.txn.open_table(tables::SHARDS)?;
            let prefix = shard_prefix(shard_map_id);
            let mut result = Vec::new();
            for entry in table.range(prefix.as_str()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix.as_str()) {
                    break;
                }
                result.push(decode(v.value())?);
            }
            Ok(result)
        }

        fn mapping(&self, id: MappingId) -> MetaStoreResult<Option<Mapping>> {
            let row_key = {
                let index = self.txn.open_table(tables::MAPPING_INDEX)?;
                let key = id.to_string();
                index.get(key.as_str())?.map(|k| k.value().to_vec())
            };
            let Some(row_key) = row_key else {
                return Ok(None);
            };
            let table = self.txn.open_table(tables::MAPPINGS)?;
            let Some(row) = table.get(row_key.as_slice())? else {
                return Err(MetaStoreError::Corrupt {
                    table: "mapping_index",
                    detail: format!("mapping {id} is indexed but has no row"),
                });
            };
            decode(row.value()).map(Some)
        }

        fn mappings(&self, shard_map_id: ShardMapId) -> MetaStoreResult<Vec<Mapping>> {
            let table = self.txn.open_table(tables::MAPPINGS)?;
            let prefix = shard_map_id.as_bytes().as_slice();
            let mut result = Vec::new();
            for entry in table.range(prefix..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix) {
                    break;
                }
                result.push(decode(v.value())?);
            }
            Ok(result)
        }

        fn mapping_for_key(
            &self,
            shard_map_id: ShardMapId,
            key: &ShardKey,
        ) -> MetaStoreResult<Option<Mapping>> {
            // No range contains the maximum sentinel
            let Some(raw) = key.raw_value() else {
                return Ok(None);
            };
            let table = self.txn.open_table(tables::MAPPINGS)?;
            let prefix = shard_map_id.as_bytes().as_slice();
            let probe = mapping_key(shard_map_id, raw);
            // The candidate is the mapping with the greatest low key <= key
            let mut candidates = table.range(prefix..=probe.as_slice())?;
            let Some(entry) = candidates.next_back() else {
                return Ok(None);
            };
            let (_, v) = entry?;
            let mapping: Mapping = decode(v.value())?;
            Ok(mapping.range.contains(key).then_some(mapping))
        }

        fn overlapping_mappings(
            &self,
            shard_map_id: ShardMapId,
            range: &ShardRange,
        ) -> MetaStoreResult<Vec<Mapping>> {
            let mut result = Vec::new();
            let Some(low) = range.low().raw_value() else {
                return Ok(result);
            };
            if let Some(mapping) = self.mapping_for_key(shard_map_id, range.low())? {
                result.push(mapping);
            }
            let table = self.txn.open_table(tables::MAPPINGS)?;
            let prefix = shard_map_id.as_bytes().as_slice();
            let start = mapping_key(shard_map_id, low);
            for entry in table.range(start.as_slice()..)? {
                let (k, v) = entry?;
                if !k.value().starts_with(prefix) {
                    break;
                }
                let mapping: Mapping = decode(v.value())?;
                if mapping.range.low() >= range.high() {
                    break;
                }
                if result.iter().all(|m| m.id != mapping.id) {
                    result.push(mapping);
                }
            }
            Ok(result)
        }

        fn pending_operation(
            &self,
            shard_map_id: ShardMapId,
        ) -> MetaStoreResult<Option<StoredOperation>> {
            let table = self.txn.open_table(tables::PENDING_OPERATIONS)?;
            let key = shard_map_id.to_string();
            table
                .get(key.as_str())?
                .map(|v| decode(v.value()))
                .transpose()
        }

        fn pending_operations(&self) -> MetaStoreResult<Vec<StoredOperation>> {
            let table = self.txn.open_table(tables::PENDING_OPERATIONS)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let (_, v) = entry?;
                result.push(decode(v.value())?);
            }
            Ok(result)
        }

        fn schema_info(&self, shard_map_name: &str) -> MetaStoreResult<Option<Vec<u8>>> {
            let table = self.txn.open_table(tables::SCHEMA_INFO)?;
            Ok(table.get(shard_map_name)?.map(|v| v.value().to_vec()))
        }

        fn schema_infos(&self) -> MetaStoreResult<Vec<(String, Vec<u8>)>> {
            let table = self.txn.open_table(tables::SCHEMA_INFO)?;
            let mut result = Vec::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                result.push((k.value().to_string(), v.value().to_vec()));
            }
            Ok(result)
        }
    };
}

fn uuid_from_str(s: &str, table: &'static str) -> MetaStoreResult<uuid::Uuid> {
    uuid::Uuid::from_str(s).map_err(|e| MetaStoreError::Corrupt {
        table,
        detail: e.to_string(),
    })
}

/// A write transaction on one store
pub struct StoreTxn<'a> {
    txn: &'a redb::WriteTransaction,
}

impl StoreRead for StoreTxn<'_> {
    store_read_methods!();
}

impl StoreTxn<'_> {
    fn put_meta<T: Serialize>(&self, key: &str, value: &T) -> MetaStoreResult<()> {
        let bytes = encode(value)?;
        let mut table = self.txn.open_table(tables::STORE_META)?;
        table.insert(key, bytes.as_slice())?;
        Ok(())
    }

    pub fn set_identity(
        &self,
        kind: StoreKind,
        location: Option<&ShardLocation>,
    ) -> MetaStoreResult<()> {
        self.put_meta(META_KIND, &kind)?;
        if let Some(location) = location {
            self.put_meta(META_LOCATION, location)?;
        }
        Ok(())
    }

    pub fn set_schema_version(&self, version: SchemaVersion) -> MetaStoreResult<()> {
        self.put_meta(META_VERSION, &version)
    }

    // ---- Shard maps ----

    pub fn put_shard_map(&self, shard_map: &ShardMap) -> MetaStoreResult<()> {
        let bytes = encode(shard_map)?;
        let id = shard_map.id.to_string();
        {
            let mut table = self.txn.open_table(tables::SHARD_MAPS)?;
            table.insert(id.as_str(), bytes.as_slice())?;
        }
        let mut names = self.txn.open_table(tables::SHARD_MAP_NAMES)?;
        names.insert(shard_map.name.as_str(), id.as_str())?;
        Ok(())
    }

    pub fn remove_shard_map(&self, shard_map: &ShardMap) -> MetaStoreResult<()> {
        let id = shard_map.id.to_string();
        {
            let mut table = self.txn.open_table(tables::SHARD_MAPS)?;
            table.remove(id.as_str())?;
        }
        let mut names = self.txn.open_table(tables::SHARD_MAP_NAMES)?;
        names.remove(shard_map.name.as_str())?;
        Ok(())
    }

    // ---- Shards ----

    pub fn put_shard(&self, shard: &Shard) -> MetaStoreResult<()> {
        let bytes = encode(shard)?;
        let key = shard_key(shard.shard_map_id, shard.id);
        let mut table = self.txn.open_table(tables::SHARDS)?;
        table.insert(key.as_str(), bytes.as_slice())?;
        Ok(())
    }

    pub fn remove_shard(&self, shard_map_id: ShardMapId, id: ShardId) -> MetaStoreResult<bool> {
        let key = shard_key(shard_map_id, id);
        let mut table = self.txn.open_table(tables::SHARDS)?;
        Ok(table.remove(key.as_str())?.is_some())
    }

    // ---- Mappings ----

    pub fn put_mapping(&self, mapping: &Mapping) -> MetaStoreResult<()> {
        let Some(low) = mapping.range.low().raw_value() else {
            return Err(MetaStoreError::Corrupt {
                table: "mappings",
                detail: format!("mapping {} starts at the maximum key", mapping.id),
            });
        };
        let row_key = mapping_key(mapping.shard_map_id, low);
        let index_key = mapping.id.to_string();
        let previous = {
            let mut index = self.txn.open_table(tables::MAPPING_INDEX)?;
            index
                .insert(index_key.as_str(), row_key.as_slice())?
                .map(|old| old.value().to_vec())
        };
        let bytes = encode(mapping)?;
        let mut table = self.txn.open_table(tables::MAPPINGS)?;
        if let Some(previous) = previous.filter(|old| *old != row_key) {
            table.remove(previous.as_slice())?;
        }
        table.insert(row_key.as_slice(), bytes.as_slice())?;
        Ok(())
    }

    /// Remove a mapping, returning the removed row
    pub fn remove_mapping(&self, id: MappingId) -> MetaStoreResult<Option<Mapping>> {
        let index_key = id.to_string();
        let row_key = {
            let mut index = self.txn.open_table(tables::MAPPING_INDEX)?;
            let removed = index.remove(index_key.as_str())?;
            removed.map(|k| k.value().to_vec())
        };
        let Some(row_key) = row_key else {
            return Ok(None);
        };
        let mut table = self.txn.open_table(tables::MAPPINGS)?;
        let removed = table.remove(row_key.as_slice())?;
        removed.map(|v| decode(v.value())).transpose()
    }

    /// Remove every shard and mapping row of a shard map
    pub fn clear_shard_map_contents(&self, shard_map_id: ShardMapId) -> MetaStoreResult<()> {
        for mapping in self.mappings(shard_map_id)? {
            self.remove_mapping(mapping.id)?;
        }
        for shard in self.shards(shard_map_id)? {
            self.remove_shard(shard_map_id, shard.id)?;
        }
        Ok(())
    }

    // ---- Pending operations ----

    /// Record a pending operation for its shard map.
    ///
    /// If a different operation is already pending on the map, nothing is
    /// written and that operation is returned.
    pub fn insert_pending(&self, op: &StoredOperation) -> MetaStoreResult<Option<StoredOperation>> {
        if let Some(existing) = self.pending_operation(op.shard_map_id)? {
            if existing.id != op.id {
                return Ok(Some(existing));
            }
        }
        self.update_pending(op)?;
        Ok(None)
    }

    pub fn update_pending(&self, op: &StoredOperation) -> MetaStoreResult<()> {
        let bytes = encode(op)?;
        let key = op.shard_map_id.to_string();
        let mut table = self.txn.open_table(tables::PENDING_OPERATIONS)?;
        table.insert(key.as_str(), bytes.as_slice())?;
        Ok(())
    }

    /// Remove the pending entry of a shard map if it belongs to `op`
    pub fn remove_pending(&self, op: &StoredOperation) -> MetaStoreResult<bool> {
        match self.pending_operation(op.shard_map_id)? {
            Some(existing) if existing.id == op.id => {
                let key = op.shard_map_id.to_string();
                let mut table = self.txn.open_table(tables::PENDING_OPERATIONS)?;
                table.remove(key.as_str())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // ---- Schema info ----

    pub fn put_schema_info(&self, shard_map_name: &str, blob: &[u8]) -> MetaStoreResult<()> {
        let mut table = self.txn.open_table(tables::SCHEMA_INFO)?;
        table.insert(shard_map_name, blob)?;
        Ok(())
    }

    pub fn remove_schema_info(&self, shard_map_name: &str) -> MetaStoreResult<bool> {
        let mut table = self.txn.open_table(tables::SCHEMA_INFO)?;
        Ok(table.remove(shard_map_name)?.is_some())
    }
}

/// A read-only snapshot of one store
pub struct StoreSnapshot {
    txn: redb::ReadTransaction,
}

impl StoreRead for StoreSnapshot {
    store_read_methods!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OperationState;
    use shardmeta_common::{
        MappingLockToken, MappingStatus, OperationId, ShardMapKind, ShardRef, ShardStatus,
        VersionStamp,
    };
    use shardmeta_key::ShardKeyType;
    use tempfile::tempdir;

    fn key(v: i32) -> ShardKey {
        ShardKey::new(v).unwrap()
    }

    fn sample_map() -> ShardMap {
        ShardMap::new("customers", ShardMapKind::Range, ShardKeyType::Int32)
    }

    fn sample_shard(map: &ShardMap, db: &str) -> Shard {
        Shard {
            id: ShardId::new(),
            shard_map_id: map.id,
            location: ShardLocation::new("srv", db).unwrap(),
            status: ShardStatus::Online,
            version: VersionStamp::INITIAL,
        }
    }

    fn sample_mapping(map: &ShardMap, shard: &Shard, range: ShardRange) -> Mapping {
        Mapping {
            id: MappingId::new(),
            shard_map_id: map.id,
            range,
            shard: ShardRef::from(shard),
            status: MappingStatus::Online,
            version: VersionStamp::INITIAL,
            lock_owner: MappingLockToken::NO_LOCK,
        }
    }

    fn sample_op(map: &ShardMap) -> StoredOperation {
        StoredOperation {
            id: OperationId::new(),
            shard_map_id: map.id,
            shard_map_name: map.name.clone(),
            kind: "AddShard".into(),
            state: OperationState::GlobalPreLocalExecuted,
            payload: vec![1, 2, 3],
            created_at: 0,
            attempts: 1,
        }
    }

    #[test]
    fn test_deploy_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("global.redb");
        {
            let store = MetaStore::open(&path).unwrap();
            assert_eq!(store.schema_version().unwrap(), None);
            assert!(store
                .deploy(StoreKind::Global, SchemaVersion::new(1, 3), None)
                .unwrap());
            assert!(!store
                .deploy(StoreKind::Global, SchemaVersion::new(1, 0), None)
                .unwrap());
        }
        let store = MetaStore::open(&path).unwrap();
        assert_eq!(store.schema_version().unwrap(), Some(SchemaVersion::new(1, 3)));
        let kind: Result<_, MetaStoreError> = store.read(|s| s.store_kind());
        assert_eq!(kind.unwrap(), Some(StoreKind::Global));
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let result: Result<(), Error> = store.write(|txn| {
            txn.put_shard_map(&map)?;
            Err(Error::internal("boom"))
        });
        assert!(result.is_err());
        let found: Result<_, MetaStoreError> = store.read(|s| s.shard_map(map.id));
        assert_eq!(found.unwrap(), None);
    }

    #[test]
    fn test_shard_map_by_name() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        store.write(|txn| txn.put_shard_map(&map)).unwrap();
        let by_name: Result<_, MetaStoreError> = store.read(|s| s.shard_map_by_name("customers"));
        assert_eq!(by_name.unwrap(), Some(map.clone()));

        store.write(|txn| txn.remove_shard_map(&map)).unwrap();
        let all: Result<_, MetaStoreError> = store.read(StoreRead::shard_maps);
        assert!(all.unwrap().is_empty());
    }

    #[test]
    fn test_shards_are_scoped_to_their_map() {
        let store = MetaStore::in_memory("test").unwrap();
        let a = sample_map();
        let b = ShardMap::new("orders", ShardMapKind::List, ShardKeyType::Int64);
        let s1 = sample_shard(&a, "db1");
        let s2 = sample_shard(&a, "db2");
        let s3 = sample_shard(&b, "db1");
        store
            .write(|txn| {
                txn.put_shard(&s1)?;
                txn.put_shard(&s2)?;
                txn.put_shard(&s3)
            })
            .unwrap();

        let shards: Vec<Shard> = store
            .read(|s| -> MetaStoreResult<_> { s.shards(a.id) })
            .unwrap();
        assert_eq!(shards.len(), 2);
        let found: Option<Shard> = store
            .read(|s| -> MetaStoreResult<_> { s.shard_by_location(b.id, &s3.location) })
            .unwrap();
        assert_eq!(found.map(|s| s.id), Some(s3.id));
    }

    #[test]
    fn test_mapping_lookup_by_key() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let shard = sample_shard(&map, "db1");
        let low = sample_mapping(&map, &shard, ShardRange::new(key(-100), key(0)).unwrap());
        let high = sample_mapping(
            &map,
            &shard,
            ShardRange::new(key(50), ShardKey::max(ShardKeyType::Int32)).unwrap(),
        );
        store
            .write(|txn| {
                txn.put_mapping(&high)?;
                txn.put_mapping(&low)
            })
            .unwrap();

        let lookup = |k: ShardKey| -> Option<MappingId> {
            store
                .read(|s| -> MetaStoreResult<_> { s.mapping_for_key(map.id, &k) })
                .unwrap()
                .map(|m| m.id)
        };
        assert_eq!(lookup(key(-100)), Some(low.id));
        assert_eq!(lookup(key(-1)), Some(low.id));
        assert_eq!(lookup(key(0)), None);
        assert_eq!(lookup(key(49)), None);
        assert_eq!(lookup(key(50)), Some(high.id));
        assert_eq!(lookup(key(i32::MAX)), Some(high.id));
        assert_eq!(lookup(key(i32::MIN)), None);
        assert_eq!(lookup(ShardKey::max(ShardKeyType::Int32)), None);

        let ordered: Vec<Mapping> = store
            .read(|s| -> MetaStoreResult<_> { s.mappings(map.id) })
            .unwrap();
        assert_eq!(ordered.iter().map(|m| m.id).collect::<Vec<_>>(), vec![low.id, high.id]);
    }

    #[test]
    fn test_lookup_from_minimum() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let shard = sample_shard(&map, "db1");
        let full = sample_mapping(&map, &shard, ShardRange::full(ShardKeyType::Int32));
        store.write(|txn| txn.put_mapping(&full)).unwrap();
        let found: Option<Mapping> = store
            .read(|s| -> MetaStoreResult<_> { s.mapping_for_key(map.id, &key(i32::MIN)) })
            .unwrap();
        assert_eq!(found.map(|m| m.id), Some(full.id));
    }

    #[test]
    fn test_overlapping_mappings() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let shard = sample_shard(&map, "db1");
        let a = sample_mapping(&map, &shard, ShardRange::new(key(0), key(10)).unwrap());
        let b = sample_mapping(&map, &shard, ShardRange::new(key(20), key(30)).unwrap());
        store
            .write(|txn| {
                txn.put_mapping(&a)?;
                txn.put_mapping(&b)
            })
            .unwrap();

        let overlaps = |lo: i32, hi: i32| -> Vec<MappingId> {
            let range = ShardRange::new(key(lo), key(hi)).unwrap();
            store
                .read(|s| -> MetaStoreResult<_> { s.overlapping_mappings(map.id, &range) })
                .unwrap()
                .into_iter()
                .map(|m| m.id)
                .collect()
        };
        assert_eq!(overlaps(5, 25), vec![a.id, b.id]);
        assert_eq!(overlaps(10, 20), Vec::<MappingId>::new());
        assert_eq!(overlaps(29, 40), vec![b.id]);
        assert_eq!(overlaps(-5, 1), vec![a.id]);
    }

    #[test]
    fn test_remove_mapping() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let shard = sample_shard(&map, "db1");
        let m = sample_mapping(&map, &shard, ShardRange::point(key(7)).unwrap());
        store.write(|txn| txn.put_mapping(&m)).unwrap();
        let fetched: Option<Mapping> = store
            .read(|s| -> MetaStoreResult<_> { s.mapping(m.id) })
            .unwrap();
        assert_eq!(fetched, Some(m.clone()));

        let removed = store.write(|txn| txn.remove_mapping(m.id)).unwrap();
        assert_eq!(removed.map(|r| r.id), Some(m.id));
        assert_eq!(store.write(|txn| txn.remove_mapping(m.id)).unwrap(), None);
    }

    #[test]
    fn test_one_pending_operation_per_map() {
        let store = MetaStore::in_memory("test").unwrap();
        let map = sample_map();
        let first = sample_op(&map);
        let second = sample_op(&map);

        assert_eq!(store.write(|txn| txn.insert_pending(&first)).unwrap(), None);
        let conflict = store.write(|txn| txn.insert_pending(&second)).unwrap();
        assert_eq!(conflict.map(|op| op.id), Some(first.id));

        assert!(!store.write(|txn| txn.remove_pending(&second)).unwrap());
        assert!(store.write(|txn| txn.remove_pending(&first)).unwrap());
        let pending: Vec<StoredOperation> = store
            .read(|s| -> MetaStoreResult<_> { s.pending_operations() })
            .unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_unavailable_is_transient() {
        let err = MetaStoreError::Unavailable("srv/db".into());
        assert!(err.is_transient());
        assert!(Error::from(err).is_transient());

        let io = MetaStoreError::Io(std::io::Error::new(ErrorKind::TimedOut, "slow"));
        assert!(io.is_transient());
        let corrupt = MetaStoreError::Io(std::io::Error::new(ErrorKind::InvalidData, "bad"));
        assert!(!Error::from(corrupt).is_transient());
    }
}
