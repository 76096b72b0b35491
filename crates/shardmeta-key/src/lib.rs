//! ShardMeta Key - canonical shard key encoding
//!
//! Maps typed key values to byte sequences whose unsigned lexicographic
//! order matches the backing database engine's collation, and defines the
//! successor function and the min/max sentinels used by range mappings.

pub mod error;
pub mod key;
pub mod key_type;
pub mod range;
pub mod time;
pub mod value;

pub use error::KeyError;
pub use key::ShardKey;
pub use key_type::ShardKeyType;
pub use range::ShardRange;
pub use time::{DateTime, DateTimeOffset, TimeSpan};
pub use value::{ShardKeyValue, decode, encode};
