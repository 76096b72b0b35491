//! Redb table definitions for the metadata stores.
//!
//! Global and local stores share one layout; a local store only holds the
//! rows relevant to its shard.

use redb::TableDefinition;

// Shard maps
// Key: shard map id, Value: bincode-encoded ShardMap
pub const SHARD_MAPS: TableDefinition<&str, &[u8]> = TableDefinition::new("shard_maps");
// Key: shard map name, Value: shard map id
pub const SHARD_MAP_NAMES: TableDefinition<&str, &str> = TableDefinition::new("shard_map_names");

// Key: "map_id:shard_id", Value: bincode-encoded Shard
pub const SHARDS: TableDefinition<&str, &[u8]> = TableDefinition::new("shards");

// Mappings
// Key: shard map id (16 bytes) ++ raw low key, so table order is key order
// within a shard map. Value: bincode-encoded Mapping
pub const MAPPINGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("mappings");
// Key: mapping id, Value: key into MAPPINGS
pub const MAPPING_INDEX: TableDefinition<&str, &[u8]> = TableDefinition::new("mapping_index");

// Key: shard map id, Value: bincode-encoded StoredOperation (one per map)
pub const PENDING_OPERATIONS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_operations");

// Key: shard map name, Value: JSON schema info blob
pub const SCHEMA_INFO: TableDefinition<&str, &[u8]> = TableDefinition::new("schema_info");

// Store identity and schema version
// Keys: "version" (bincode SchemaVersion), "kind" (bincode StoreKind),
// "location" (bincode ShardLocation, local stores only)
pub const STORE_META: TableDefinition<&str, &[u8]> = TableDefinition::new("store_meta");
