//! Error types for ShardMeta
//!
//! Errors are classified by category (who can fix it and whether a retry
//! helps) and carry a stable code for callers that match on strings.

use crate::types::{LocationError, MappingId, OperationId, SchemaVersion, SchemaVersionParseError};
use shardmeta_key::KeyError;
use thiserror::Error;

/// Common result type for ShardMeta operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Rejected before touching any store
    Validation,
    /// Optimistic concurrency or existence conflicts in the stores
    Concurrency,
    /// Store schema version does not fit the request
    Schema,
    /// Store access failures, transient or exhausted
    Storage,
    /// Key encoding failures
    Codec,
    Internal,
}

/// Common error type for ShardMeta
#[derive(Debug, Error)]
pub enum Error {
    // Validation errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid shard location: {0}")]
    InvalidLocation(#[from] LocationError),

    #[error("invalid schema version: {0}")]
    InvalidSchemaVersion(#[from] SchemaVersionParseError),

    // Shard map errors
    #[error("shard map does not exist: {0}")]
    ShardMapDoesNotExist(String),

    #[error("shard map already exists: {0}")]
    ShardMapAlreadyExists(String),

    #[error("shard map '{0}' was modified concurrently")]
    ShardMapVersionMismatch(String),

    #[error("shard map '{0}' still has mappings")]
    ShardMapHasMappings(String),

    // Shard errors
    #[error("shard {location} does not exist in shard map '{shard_map}'")]
    ShardDoesNotExist { shard_map: String, location: String },

    #[error("shard location {location} already exists in shard map '{shard_map}'")]
    ShardLocationAlreadyExists { shard_map: String, location: String },

    #[error("shard {location} in shard map '{shard_map}' was modified concurrently")]
    ShardVersionMismatch { shard_map: String, location: String },

    #[error("shard {location} in shard map '{shard_map}' still has mappings")]
    ShardHasMappings { shard_map: String, location: String },

    // Mapping errors
    #[error("mapping {mapping} does not exist in shard map '{shard_map}'")]
    MappingDoesNotExist { shard_map: String, mapping: MappingId },

    #[error("mapping {mapping} in shard map '{shard_map}' was modified concurrently")]
    MappingVersionMismatch { shard_map: String, mapping: MappingId },

    #[error("range {range} overlaps an existing mapping in shard map '{shard_map}'")]
    MappingRangeAlreadyMapped { shard_map: String, range: String },

    #[error("point {key} is already mapped in shard map '{shard_map}'")]
    MappingPointAlreadyMapped { shard_map: String, key: String },

    #[error("mapping {mapping} in shard map '{shard_map}' must be offline")]
    MappingIsNotOffline { shard_map: String, mapping: MappingId },

    #[error("mapping {mapping} in shard map '{shard_map}' is already locked")]
    MappingIsAlreadyLocked { shard_map: String, mapping: MappingId },

    #[error("lock owner of mapping {mapping} in shard map '{shard_map}' does not match")]
    MappingLockOwnerIdDoesNotMatch { shard_map: String, mapping: MappingId },

    #[error("no mapping for key {key} in shard map '{shard_map}'")]
    MappingNotFoundForKey { shard_map: String, key: String },

    // Pending operation errors
    #[error("operation {operation} is pending on shard map '{shard_map}'")]
    OperationPending {
        shard_map: String,
        operation: OperationId,
    },

    #[error("pending operation does not exist: {0}")]
    OperationDoesNotExist(OperationId),

    // Schema errors
    #[error("global store version {store} is incompatible, requires {required}")]
    GlobalStoreVersionMismatch {
        store: SchemaVersion,
        required: SchemaVersion,
    },

    #[error("local store {location} version {store} is incompatible, requires {required}")]
    LocalStoreVersionMismatch {
        location: String,
        store: SchemaVersion,
        required: SchemaVersion,
    },

    #[error("store has not been deployed: {0}")]
    StoreNotDeployed(String),

    // Codec errors
    #[error("shard key error: {0}")]
    Key(#[from] KeyError),

    // Storage errors
    #[error("{operation} failed after {attempts} attempts: {source}")]
    StorageOperationFailure {
        operation: String,
        attempts: u32,
        source: Box<Error>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("request timeout")]
    Timeout,

    #[error("serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Check if this is a connectivity/timeout-class fault worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::StoreUnavailable(_) | Self::ConnectionFailed(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ShardMapDoesNotExist(_)
                | Self::ShardDoesNotExist { .. }
                | Self::MappingDoesNotExist { .. }
                | Self::MappingNotFoundForKey { .. }
                | Self::OperationDoesNotExist(_)
        )
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidArgument(_) | Self::InvalidLocation(_) | Self::InvalidSchemaVersion(_) => {
                ErrorCategory::Validation
            }

            Self::ShardMapDoesNotExist(_)
            | Self::ShardMapAlreadyExists(_)
            | Self::ShardMapVersionMismatch(_)
            | Self::ShardMapHasMappings(_)
            | Self::ShardDoesNotExist { .. }
            | Self::ShardLocationAlreadyExists { .. }
            | Self::ShardVersionMismatch { .. }
            | Self::ShardHasMappings { .. }
            | Self::MappingDoesNotExist { .. }
            | Self::MappingVersionMismatch { .. }
            | Self::MappingRangeAlreadyMapped { .. }
            | Self::MappingPointAlreadyMapped { .. }
            | Self::MappingIsNotOffline { .. }
            | Self::MappingIsAlreadyLocked { .. }
            | Self::MappingLockOwnerIdDoesNotMatch { .. }
            | Self::MappingNotFoundForKey { .. }
            | Self::OperationPending { .. }
            | Self::OperationDoesNotExist(_) => ErrorCategory::Concurrency,

            Self::GlobalStoreVersionMismatch { .. }
            | Self::LocalStoreVersionMismatch { .. }
            | Self::StoreNotDeployed(_) => ErrorCategory::Schema,

            Self::Key(_) => ErrorCategory::Codec,

            Self::StorageOperationFailure { .. }
            | Self::Storage(_)
            | Self::StoreUnavailable(_)
            | Self::ConnectionFailed(_)
            | Self::Timeout
            | Self::Serialization(_) => ErrorCategory::Storage,

            Self::Configuration(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::InvalidLocation(_) => "InvalidShardLocation",
            Self::InvalidSchemaVersion(_) => "InvalidSchemaVersion",
            Self::ShardMapDoesNotExist(_) => "ShardMapDoesNotExist",
            Self::ShardMapAlreadyExists(_) => "ShardMapAlreadyExists",
            Self::ShardMapVersionMismatch(_) => "ShardMapVersionMismatch",
            Self::ShardMapHasMappings(_) => "ShardMapHasMappings",
            Self::ShardDoesNotExist { .. } => "ShardDoesNotExist",
            Self::ShardLocationAlreadyExists { .. } => "ShardLocationAlreadyExists",
            Self::ShardVersionMismatch { .. } => "ShardVersionMismatch",
            Self::ShardHasMappings { .. } => "ShardHasMappings",
            Self::MappingDoesNotExist { .. } => "MappingDoesNotExist",
            Self::MappingVersionMismatch { .. } => "MappingVersionMismatch",
            Self::MappingRangeAlreadyMapped { .. } => "MappingRangeAlreadyMapped",
            Self::MappingPointAlreadyMapped { .. } => "MappingPointAlreadyMapped",
            Self::MappingIsNotOffline { .. } => "MappingIsNotOffline",
            Self::MappingIsAlreadyLocked { .. } => "MappingIsAlreadyLocked",
            Self::MappingLockOwnerIdDoesNotMatch { .. } => "MappingLockOwnerIdDoesNotMatch",
            Self::MappingNotFoundForKey { .. } => "MappingNotFoundForKey",
            Self::OperationPending { .. } => "OperationPending",
            Self::OperationDoesNotExist(_) => "OperationDoesNotExist",
            Self::GlobalStoreVersionMismatch { .. } => "GlobalStoreVersionMismatch",
            Self::LocalStoreVersionMismatch { .. } => "LocalStoreVersionMismatch",
            Self::StoreNotDeployed(_) => "StoreNotDeployed",
            Self::Key(KeyError::NoSuccessor(_)) => "NoSuccessor",
            Self::Key(KeyError::UnsupportedKeyType(_)) => "UnsupportedShardKeyType",
            Self::Key(KeyError::TypeMismatch { .. }) => "KeyTypeMismatch",
            Self::Key(_) => "InvalidShardKey",
            Self::StorageOperationFailure { .. } => "StorageOperationFailure",
            Self::Storage(_) => "StorageError",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::Timeout => "Timeout",
            Self::Serialization(_) => "SerializationError",
            Self::Configuration(_) => "ConfigurationError",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The fault behind an exhausted retry, or the error itself
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::StorageOperationFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
