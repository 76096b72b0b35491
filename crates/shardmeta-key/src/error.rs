//! Key codec errors

use crate::key_type::ShardKeyType;

/// Errors raised while encoding, decoding or stepping shard keys
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unsupported shard key type: {0}")]
    UnsupportedKeyType(String),

    #[error("the maximum key of type {0} has no successor")]
    NoSuccessor(ShardKeyType),

    #[error("invalid raw length for {key_type}: {len} bytes (max {max})")]
    InvalidLength {
        key_type: ShardKeyType,
        len: usize,
        max: usize,
    },

    #[error("value out of range for {key_type}: {detail}")]
    ValueOutOfRange {
        key_type: ShardKeyType,
        detail: String,
    },

    #[error("key type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ShardKeyType,
        actual: ShardKeyType,
    },

    #[error("invalid range: low {low} must be below high {high}")]
    InvalidRange { low: String, high: String },
}

impl KeyError {
    pub(crate) fn out_of_range(key_type: ShardKeyType, detail: impl Into<String>) -> Self {
        Self::ValueOutOfRange {
            key_type,
            detail: detail.into(),
        }
    }
}
