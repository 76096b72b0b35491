//! Schema info blobs attached to shard maps.
//!
//! The blob is JSON. Stores before 1.3 used PascalCase container names
//! (`ReferenceTableSet`, `ShardedTableSet`); `decode` accepts both forms and
//! `upgrade_blob` rewrites a legacy blob into the current one.

use serde::{Deserialize, Serialize};

/// A table replicated to every shard
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceTable {
    pub schema: String,
    pub name: String,
}

/// A table partitioned by a key column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedTable {
    pub schema: String,
    pub name: String,
    pub key_column: String,
}

/// Which tables of a shard map's databases are replicated and which are sharded
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaInfo {
    #[serde(default)]
    pub reference_tables: Vec<ReferenceTable>,
    #[serde(default)]
    pub sharded_tables: Vec<ShardedTable>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyReferenceTable {
    schema: String,
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct LegacyShardedTable {
    schema: String,
    name: String,
    key_column: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct LegacySchemaInfo {
    #[serde(rename = "ReferenceTableSet", default)]
    reference_tables: Vec<LegacyReferenceTable>,
    #[serde(rename = "ShardedTableSet", default)]
    sharded_tables: Vec<LegacyShardedTable>,
}

impl From<LegacySchemaInfo> for SchemaInfo {
    fn from(legacy: LegacySchemaInfo) -> Self {
        Self {
            reference_tables: legacy
                .reference_tables
                .into_iter()
                .map(|t| ReferenceTable {
                    schema: t.schema,
                    name: t.name,
                })
                .collect(),
            sharded_tables: legacy
                .sharded_tables
                .into_iter()
                .map(|t| ShardedTable {
                    schema: t.schema,
                    name: t.name,
                    key_column: t.key_column,
                })
                .collect(),
        }
    }
}

impl SchemaInfo {
    pub fn add_reference_table(&mut self, schema: impl Into<String>, name: impl Into<String>) {
        self.reference_tables.push(ReferenceTable {
            schema: schema.into(),
            name: name.into(),
        });
    }

    pub fn add_sharded_table(
        &mut self,
        schema: impl Into<String>,
        name: impl Into<String>,
        key_column: impl Into<String>,
    ) {
        self.sharded_tables.push(ShardedTable {
            schema: schema.into(),
            name: name.into(),
            key_column: key_column.into(),
        });
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode either the current or the legacy blob form
    pub fn decode(blob: &[u8]) -> serde_json::Result<Self> {
        if is_legacy(blob) {
            return serde_json::from_slice::<LegacySchemaInfo>(blob).map(Into::into);
        }
        serde_json::from_slice(blob)
    }
}

fn is_legacy(blob: &[u8]) -> bool {
    serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(blob).is_ok_and(|obj| {
        obj.contains_key("ReferenceTableSet") || obj.contains_key("ShardedTableSet")
    })
}

/// Rewrite a legacy blob in the current form; `None` if it is already current
pub fn upgrade_blob(blob: &[u8]) -> serde_json::Result<Option<Vec<u8>>> {
    if !is_legacy(blob) {
        return Ok(None);
    }
    SchemaInfo::decode(blob)?.encode().map(Some)
}

/// Encode in the form used by stores before 1.3
pub fn encode_legacy(info: &SchemaInfo) -> serde_json::Result<Vec<u8>> {
    let reference: Vec<_> = info
        .reference_tables
        .iter()
        .map(|t| serde_json::json!({ "Schema": t.schema, "Name": t.name }))
        .collect();
    let sharded: Vec<_> = info
        .sharded_tables
        .iter()
        .map(|t| serde_json::json!({ "Schema": t.schema, "Name": t.name, "KeyColumn": t.key_column }))
        .collect();
    serde_json::to_vec(&serde_json::json!({
        "ReferenceTableSet": reference,
        "ShardedTableSet": sharded,
    }))
}
