//! Table and column schema records used for key/value decoding.
//!
//! Schema rows are persisted by the catalog and shipped to tablets inside
//! change-metadata log entries; the CDC producer resolves historical
//! versions through the catalog client.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::SchemaVersion;

/// Identifier of a column within one table schema.
pub type ColumnId = u32;

/// PostgreSQL type OID for `boolean`.
pub const PG_OID_BOOL: u32 = 16;
/// PostgreSQL type OID for `bigint`.
pub const PG_OID_INT8: u32 = 20;
/// PostgreSQL type OID for `smallint`.
pub const PG_OID_INT2: u32 = 21;
/// PostgreSQL type OID for `integer`.
pub const PG_OID_INT4: u32 = 23;
/// PostgreSQL type OID for `text`.
pub const PG_OID_TEXT: u32 = 25;
/// PostgreSQL type OID for `double precision`.
pub const PG_OID_FLOAT8: u32 = 701;
/// PostgreSQL type OID for `character varying`.
pub const PG_OID_VARCHAR: u32 = 1043;
/// PostgreSQL type OID for `timestamp without time zone`.
pub const PG_OID_TIMESTAMP: u32 = 1114;

/// Returns true when `oid` is one of the scalar OIDs the engine maps
/// directly onto a storage column type. Enum OIDs are table-specific and
/// resolved through the enum label map instead.
pub fn is_builtin_type_oid(oid: u32) -> bool {
    matches!(
        oid,
        PG_OID_BOOL
            | PG_OID_INT2
            | PG_OID_INT4
            | PG_OID_INT8
            | PG_OID_FLOAT8
            | PG_OID_TEXT
            | PG_OID_VARCHAR
            | PG_OID_TIMESTAMP
    )
}

/// Storage-level column type, independent of the SQL-facing OID.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int16,
    Int32,
    Int64,
    Float64,
    Boolean,
    Utf8,
    TimestampMicros,
    /// User-defined enum; payloads store the label ordinal.
    Enum,
}

/// Persisted metadata for one column of a table schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub column_id: ColumnId,
    pub name: String,
    pub column_type: ColumnType,
    /// SQL-facing PostgreSQL type OID; `0` means "no OID known".
    pub type_oid: u32,
    pub nullable: bool,
    pub is_key: bool,
    pub is_hash_key: bool,
}

/// Table-level properties carried on DDL change records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProperties {
    pub default_time_to_live_ms: u64,
    pub num_tablets: u32,
    pub is_catalog_table: bool,
}

/// One version of a table's schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    /// SQL schema (namespace) the table lives in, e.g. `public`.
    pub schema_name: String,
    /// Columns in declaration order; key columns come first.
    pub columns: Vec<ColumnSchema>,
    pub properties: TableProperties,
}

impl TableSchema {
    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_key_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    pub fn is_key_column(&self, column_id: ColumnId) -> bool {
        self.columns
            .iter()
            .any(|c| c.column_id == column_id && c.is_key)
    }

    pub fn column_by_id(&self, column_id: ColumnId) -> Result<&ColumnSchema> {
        self.columns
            .iter()
            .find(|c| c.column_id == column_id)
            .ok_or_else(|| anyhow!("column id {} not present in table schema", column_id))
    }

    pub fn column(&self, idx: usize) -> Result<&ColumnSchema> {
        self.columns
            .get(idx)
            .ok_or_else(|| anyhow!("column index {} out of bounds", idx))
    }

    /// Validates invariants the producer relies on before using a schema.
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() {
            return Err(anyhow!("table schema has no columns"));
        }
        if self.num_key_columns() == 0 {
            return Err(anyhow!("table schema has no key columns"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for column in &self.columns {
            if !seen.insert(column.column_id) {
                return Err(anyhow!("duplicate column id {} in schema", column.column_id));
            }
        }
        Ok(())
    }
}

/// A schema pinned together with the version it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedSchema {
    pub schema: TableSchema,
    pub version: SchemaVersion,
}
