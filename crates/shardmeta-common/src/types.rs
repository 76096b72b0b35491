//! Core type definitions for ShardMeta
//!
//! This module defines identifiers, shard locations, version stamps and the
//! shard map / shard / mapping entities kept in the metadata stores.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use shardmeta_key::{ShardKey, ShardKeyType, ShardRange};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random ID
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a shard map
    ShardMapId
);
uuid_id!(
    /// Unique identifier for a shard
    ShardId
);
uuid_id!(
    /// Unique identifier for a mapping
    MappingId
);
uuid_id!(
    /// Unique identifier for a store operation
    OperationId
);

/// Optimistic concurrency stamp, advanced on every committed mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("v{_0}")]
pub struct VersionStamp(u64);

impl VersionStamp {
    pub const INITIAL: Self = Self(1);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Opaque lock owner token for mappings.
///
/// Compared by value only. `NO_LOCK` marks an unlocked mapping and
/// `FORCE_UNLOCK` unlocks a mapping regardless of its owner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct MappingLockToken(Uuid);

impl MappingLockToken {
    pub const NO_LOCK: Self = Self(Uuid::nil());
    pub const FORCE_UNLOCK: Self = Self(Uuid::from_u128(u128::MAX));

    /// Generate a fresh random token
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Whether this is one of the reserved tokens
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        *self == Self::NO_LOCK || *self == Self::FORCE_UNLOCK
    }
}

impl Default for MappingLockToken {
    fn default() -> Self {
        Self::NO_LOCK
    }
}

impl fmt::Debug for MappingLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::NO_LOCK {
            write!(f, "MappingLockToken(none)")
        } else {
            write!(f, "MappingLockToken({})", self.0)
        }
    }
}

impl fmt::Display for MappingLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk schema version of a metadata store
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{major}.{minor}")]
pub struct SchemaVersion {
    pub major: u32,
    pub minor: u32,
}

impl SchemaVersion {
    #[must_use]
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

/// Errors parsing a `major.minor` version string
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid schema version '{0}', expected MAJOR.MINOR")]
pub struct SchemaVersionParseError(String);

impl FromStr for SchemaVersion {
    type Err = SchemaVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || SchemaVersionParseError(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(err)?;
        Ok(Self {
            major: major.parse().map_err(|_| err())?,
            minor: minor.parse().map_err(|_| err())?,
        })
    }
}

/// Connection protocol of a shard location
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ShardProtocol {
    #[default]
    Default,
    Tcp,
    NamedPipes,
    SharedMemory,
}

impl ShardProtocol {
    const fn stem_tag(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Tcp => "tcp",
            Self::NamedPipes => "np",
            Self::SharedMemory => "lpc",
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            Self::Default => "",
            Self::Tcp => "tcp:",
            Self::NamedPipes => "np:",
            Self::SharedMemory => "lpc:",
        }
    }
}

/// Maximum length of a server or database name
pub const MAX_LOCATION_PART_LEN: usize = 128;

/// Physical location of a shard: server, database, protocol and port
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawShardLocation")]
pub struct ShardLocation {
    server: String,
    database: String,
    protocol: ShardProtocol,
    port: u16,
}

impl ShardLocation {
    /// Create a location with the default protocol and port
    pub fn new(
        server: impl Into<String>,
        database: impl Into<String>,
    ) -> Result<Self, LocationError> {
        Self::with_protocol(server, database, ShardProtocol::Default, 0)
    }

    /// Create a location; port 0 means the protocol default
    pub fn with_protocol(
        server: impl Into<String>,
        database: impl Into<String>,
        protocol: ShardProtocol,
        port: u16,
    ) -> Result<Self, LocationError> {
        let location = Self {
            server: server.into(),
            database: database.into(),
            protocol,
            port,
        };
        location.validate()?;
        Ok(location)
    }

    fn validate(&self) -> Result<(), LocationError> {
        for (part, value) in [("server", &self.server), ("database", &self.database)] {
            if value.trim().is_empty() {
                return Err(LocationError::Empty(part));
            }
            if value.len() > MAX_LOCATION_PART_LEN {
                return Err(LocationError::TooLong(part));
            }
            if value.contains(['/', ',']) {
                return Err(LocationError::InvalidChar(part));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    #[must_use]
    pub fn database(&self) -> &str {
        &self.database
    }

    #[must_use]
    pub const fn protocol(&self) -> ShardProtocol {
        self.protocol
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// File-system safe name for this location's local store.
    ///
    /// Distinct locations always get distinct stems, also on case-insensitive
    /// file systems: only lowercase ASCII letters, digits and `-` are kept,
    /// every other byte becomes `_xx`.
    #[must_use]
    pub fn file_stem(&self) -> String {
        let escape = |s: &str| -> String {
            let mut out = String::with_capacity(s.len());
            for b in s.bytes() {
                if b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' {
                    out.push(char::from(b));
                } else {
                    out.push('_');
                    out.push_str(&hex::encode([b]));
                }
            }
            out
        };
        format!(
            "{}+{}+{}+{}",
            self.protocol.stem_tag(),
            escape(&self.server),
            escape(&self.database),
            self.port
        )
    }
}

/// Deserialized form of a `ShardLocation`, validated on the way in
#[derive(Deserialize)]
struct RawShardLocation {
    server: String,
    database: String,
    protocol: ShardProtocol,
    port: u16,
}

impl TryFrom<RawShardLocation> for ShardLocation {
    type Error = LocationError;

    fn try_from(raw: RawShardLocation) -> Result<Self, Self::Error> {
        Self::with_protocol(raw.server, raw.database, raw.protocol, raw.port)
    }
}

impl fmt::Debug for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardLocation({self})")
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.protocol.prefix(), self.server)?;
        if self.port != 0 {
            write!(f, ",{}", self.port)?;
        }
        write!(f, "/{}", self.database)
    }
}

impl FromStr for ShardLocation {
    type Err = LocationError;

    /// Parse `[tcp:|np:|lpc:]server[,port]/database`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, rest) = [
            ShardProtocol::Tcp,
            ShardProtocol::NamedPipes,
            ShardProtocol::SharedMemory,
        ]
        .into_iter()
        .find_map(|p| s.strip_prefix(p.prefix()).map(|rest| (p, rest)))
        .unwrap_or((ShardProtocol::Default, s));

        let (host, database) = rest
            .split_once('/')
            .ok_or_else(|| LocationError::Malformed(s.to_string()))?;
        let (server, port) = match host.split_once(',') {
            Some((server, port)) => (
                server,
                port.parse()
                    .map_err(|_| LocationError::Malformed(s.to_string()))?,
            ),
            None => (host, 0),
        };
        Self::with_protocol(server, database, protocol, port)
    }
}

/// Errors that can occur when creating a shard location
#[derive(Debug, Clone, thiserror::Error)]
pub enum LocationError {
    #[error("shard location {0} must not be empty")]
    Empty(&'static str),
    #[error("shard location {0} must be at most 128 characters")]
    TooLong(&'static str),
    #[error("shard location {0} contains '/' or ','")]
    InvalidChar(&'static str),
    #[error("malformed shard location '{0}'")]
    Malformed(String),
}

/// Whether a shard map holds point or range mappings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ShardMapKind {
    List,
    Range,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum ShardStatus {
    #[default]
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum MappingStatus {
    #[default]
    Online,
    Offline,
}

/// Maximum length of a shard map name
pub const MAX_SHARD_MAP_NAME_LEN: usize = 50;

/// A named collection of shards and the mappings that route keys to them
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMap {
    pub id: ShardMapId,
    pub name: String,
    pub kind: ShardMapKind,
    pub key_type: ShardKeyType,
    pub version: VersionStamp,
}

impl ShardMap {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ShardMapKind, key_type: ShardKeyType) -> Self {
        Self {
            id: ShardMapId::new(),
            name: name.into(),
            kind,
            key_type,
            version: VersionStamp::INITIAL,
        }
    }
}

/// A physical shard registered in a shard map
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub id: ShardId,
    pub shard_map_id: ShardMapId,
    pub location: ShardLocation,
    pub status: ShardStatus,
    pub version: VersionStamp,
}

/// Parameters for creating a shard
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardCreationInfo {
    pub location: ShardLocation,
    pub status: ShardStatus,
}

impl From<ShardLocation> for ShardCreationInfo {
    fn from(location: ShardLocation) -> Self {
        Self {
            location,
            status: ShardStatus::Online,
        }
    }
}

/// Changes applied by a shard update
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardUpdate {
    pub status: Option<ShardStatus>,
}

/// Non-owning reference from a mapping to its shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRef {
    pub id: ShardId,
    pub location: ShardLocation,
}

impl From<&Shard> for ShardRef {
    fn from(shard: &Shard) -> Self {
        Self {
            id: shard.id,
            location: shard.location.clone(),
        }
    }
}

/// Association of a key range (or a single key) with a shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub shard_map_id: ShardMapId,
    pub range: ShardRange,
    pub shard: ShardRef,
    pub status: MappingStatus,
    pub version: VersionStamp,
    pub lock_owner: MappingLockToken,
}

impl Mapping {
    #[must_use]
    pub fn is_point(&self) -> bool {
        self.range.is_point()
    }

    /// The single key of a point mapping
    #[must_use]
    pub fn point(&self) -> Option<&ShardKey> {
        self.is_point().then(|| self.range.low())
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock_owner != MappingLockToken::NO_LOCK
    }
}

/// Changes applied by a mapping update
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MappingUpdate {
    pub status: Option<MappingStatus>,
    pub shard: Option<Shard>,
}
