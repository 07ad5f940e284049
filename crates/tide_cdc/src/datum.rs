//! Conversion of storage-layer cell values into wire datums.
//!
//! Relational tables carry a PostgreSQL type OID per column; values are
//! rendered in that type's wire form. Enum OIDs are table-specific and go
//! through the per-request label map. A NULL cell stays distinct from an
//! absent (placeholder) tuple slot: the former is a datum with no value,
//! the latter no datum at all.

use anyhow::anyhow;
use tide_row::schema::{is_builtin_type_oid, ColumnSchema, ColumnType};
use tide_row::values::{decode_scalar_payload, ColumnValue};

use crate::error::{CdcError, Result};
use crate::events::{Datum, EnumLabelMap};

/// Builds the wire datum for one column cell. `payload` is the scalar
/// payload bytes, or `None` for an explicit NULL.
pub fn datum_for_column(
    column: &ColumnSchema,
    payload: Option<&[u8]>,
    enum_labels: &EnumLabelMap,
) -> Result<Datum> {
    // Zero OID: the engine never resolved a SQL type for this column, so
    // the datum carries the (absent) type and no value.
    if column.type_oid == 0 {
        return Ok(Datum {
            column_name: column.name.clone(),
            column_type_oid: 0,
            value: None,
        });
    }

    if column.column_type != ColumnType::Enum && !is_builtin_type_oid(column.type_oid) {
        return Err(CdcError::UnsupportedType {
            column: column.name.clone(),
            oid: column.type_oid,
        });
    }

    let Some(payload) = payload else {
        return Ok(Datum {
            column_name: column.name.clone(),
            column_type_oid: column.type_oid,
            value: None,
        });
    };

    let value = decode_scalar_payload(payload, column).map_err(CdcError::corrupt)?;
    let value = match value {
        ColumnValue::EnumOrdinal(ordinal) => translate_enum(column, ordinal, enum_labels)?,
        other => other,
    };

    Ok(Datum {
        column_name: column.name.clone(),
        column_type_oid: column.type_oid,
        value: Some(value),
    })
}

/// Builds the datum for a typed value already decoded by a scan iterator.
pub fn datum_for_value(
    column: &ColumnSchema,
    value: Option<&ColumnValue>,
    enum_labels: &EnumLabelMap,
) -> Result<Datum> {
    if column.type_oid == 0 {
        return Ok(Datum {
            column_name: column.name.clone(),
            column_type_oid: 0,
            value: None,
        });
    }
    if column.column_type != ColumnType::Enum && !is_builtin_type_oid(column.type_oid) {
        return Err(CdcError::UnsupportedType {
            column: column.name.clone(),
            oid: column.type_oid,
        });
    }
    let value = match value {
        None => None,
        Some(ColumnValue::EnumOrdinal(ordinal)) => {
            Some(translate_enum(column, *ordinal, enum_labels)?)
        }
        Some(other) => Some(other.clone()),
    };
    Ok(Datum {
        column_name: column.name.clone(),
        column_type_oid: column.type_oid,
        value,
    })
}

fn translate_enum(
    column: &ColumnSchema,
    ordinal: u32,
    enum_labels: &EnumLabelMap,
) -> Result<ColumnValue> {
    let labels = enum_labels
        .get(&column.type_oid)
        .ok_or(CdcError::UnsupportedType {
            column: column.name.clone(),
            oid: column.type_oid,
        })?;
    let label = labels.get(ordinal as usize).ok_or_else(|| {
        CdcError::corrupt(anyhow!(
            "enum ordinal {} out of range for oid {} on column '{}' ({} labels)",
            ordinal,
            column.type_oid,
            column.name,
            labels.len()
        ))
    })?;
    Ok(ColumnValue::Utf8(label.clone()))
}
