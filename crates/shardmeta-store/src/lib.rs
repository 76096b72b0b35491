//! ShardMeta Store - persistent shard map metadata
//!
//! This crate holds the redb-backed global (GSM) and local (LSM) metadata
//! stores. It only handles persistence; the multi-step protocol that keeps
//! the two consistent lives in `shardmeta-manager`.

pub mod provider;
pub mod schema_info;
pub mod store;
pub mod tables;
pub mod types;

// Re-exports
pub use provider::{DiskStoreProvider, MemoryStoreProvider, StoreProvider};
pub use schema_info::SchemaInfo;
pub use store::{MetaStore, MetaStoreError, MetaStoreResult, StoreRead, StoreSnapshot, StoreTxn};
pub use types::{OperationState, StoreKind, StoredOperation};
