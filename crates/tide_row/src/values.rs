//! Encoded value formats for row cells.
//!
//! Every stored value is one tag byte followed by a payload. Primitive
//! payloads are not self-describing: decoding needs the column's declared
//! type, which is how the engine keeps cell encodings compact.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::schema::{ColumnSchema, ColumnType};

/// Tombstone: deletes the row (no column entry) or the cell (with one).
pub const VALUE_TAG_TOMBSTONE: u8 = 0x58;
/// Null-low: the liveness cell written by row inserts.
pub const VALUE_TAG_NULL_LOW: u8 = 0x24;
/// Packed row: one value carrying multiple columns.
pub const VALUE_TAG_PACKED_ROW: u8 = 0x50;
/// Primitive scalar payload, typed by the column schema.
pub const VALUE_TAG_PRIMITIVE: u8 = 0x56;

/// Format version byte of a packed-row payload.
const PACKED_FORMAT_VERSION: u8 = 2;

/// Typed value of one column cell.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ColumnValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Boolean(bool),
    Utf8(String),
    TimestampMicros(i64),
    /// Enum label ordinal; translated to a label by the CDC layer.
    EnumOrdinal(u32),
}

/// Decoded classification of an encoded value.
#[derive(Clone, Debug, PartialEq)]
pub enum DecodedValue {
    Tombstone,
    NullLow,
    /// Per-column payloads in schema order; `None` is NULL.
    PackedRow(Vec<Option<Vec<u8>>>),
    /// Raw scalar payload, to be interpreted per the column schema.
    Primitive(Vec<u8>),
}

impl DecodedValue {
    pub fn is_tombstone(&self) -> bool {
        matches!(self, DecodedValue::Tombstone)
    }
}

/// Decodes an encoded value. `packed_columns` is the schema width used to
/// validate packed-row payloads.
pub fn decode_value(value: &[u8], packed_columns: usize) -> Result<DecodedValue> {
    let tag = *value
        .first()
        .ok_or_else(|| anyhow!("empty value buffer"))?;
    let payload = &value[1..];
    match tag {
        VALUE_TAG_TOMBSTONE => Ok(DecodedValue::Tombstone),
        VALUE_TAG_NULL_LOW => Ok(DecodedValue::NullLow),
        VALUE_TAG_PACKED_ROW => Ok(DecodedValue::PackedRow(decode_packed_row(
            payload,
            packed_columns,
        )?)),
        VALUE_TAG_PRIMITIVE => Ok(DecodedValue::Primitive(payload.to_vec())),
        other => Err(anyhow!(
            "unknown value tag {:#04x} in value {}",
            other,
            hex::encode(value)
        )),
    }
}

pub fn encode_tombstone() -> Vec<u8> {
    vec![VALUE_TAG_TOMBSTONE]
}

pub fn encode_null_low() -> Vec<u8> {
    vec![VALUE_TAG_NULL_LOW]
}

pub fn encode_primitive(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(VALUE_TAG_PRIMITIVE);
    out.extend_from_slice(payload);
    out
}

/// Encodes a packed row carrying one payload slot per column.
pub fn encode_packed_row(payloads: &[Option<Vec<u8>>]) -> Vec<u8> {
    let column_count = payloads.len() as u16;
    let null_bitmap_len = payloads.len().div_ceil(8);
    let mut null_bitmap = vec![0u8; null_bitmap_len];
    for (idx, payload) in payloads.iter().enumerate() {
        if payload.is_none() {
            null_bitmap[idx / 8] |= 1u8 << (idx % 8);
        }
    }

    let mut out = Vec::new();
    out.push(VALUE_TAG_PACKED_ROW);
    out.push(PACKED_FORMAT_VERSION);
    out.push(0); // flags
    out.extend_from_slice(&column_count.to_be_bytes());
    out.extend_from_slice(&(null_bitmap_len as u16).to_be_bytes());
    out.extend_from_slice(&null_bitmap);
    for payload in payloads.iter().flatten() {
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }
    out
}

fn decode_packed_row(bytes: &[u8], column_count: usize) -> Result<Vec<Option<Vec<u8>>>> {
    if bytes.len() < 2 {
        return Err(anyhow!("packed row payload too short"));
    }
    if bytes[0] != PACKED_FORMAT_VERSION {
        return Err(anyhow!("unsupported packed row format version {}", bytes[0]));
    }
    let mut cursor = 2usize;
    let payload_column_count = read_u16(bytes, &mut cursor)? as usize;
    if payload_column_count != column_count {
        return Err(anyhow!(
            "packed row column count mismatch: expected={}, got={}",
            column_count,
            payload_column_count
        ));
    }
    let null_bitmap_len = read_u16(bytes, &mut cursor)? as usize;
    if bytes.len() < cursor + null_bitmap_len {
        return Err(anyhow!("packed row null bitmap truncated"));
    }
    let null_bitmap = &bytes[cursor..cursor + null_bitmap_len];
    cursor += null_bitmap_len;

    let mut out = Vec::with_capacity(column_count);
    for column_idx in 0..column_count {
        if is_null(null_bitmap, column_idx) {
            out.push(None);
            continue;
        }
        let payload_len = read_u32(bytes, &mut cursor)? as usize;
        if bytes.len() < cursor + payload_len {
            return Err(anyhow!("packed row payload truncated"));
        }
        out.push(Some(bytes[cursor..cursor + payload_len].to_vec()));
        cursor += payload_len;
    }
    if cursor != bytes.len() {
        return Err(anyhow!("trailing bytes after packed row payload"));
    }
    Ok(out)
}

/// Encodes a typed column value into its scalar payload.
pub fn encode_scalar_payload(value: &ColumnValue) -> Vec<u8> {
    match value {
        ColumnValue::Int16(v) => v.to_be_bytes().to_vec(),
        ColumnValue::Int32(v) => v.to_be_bytes().to_vec(),
        ColumnValue::Int64(v) => v.to_be_bytes().to_vec(),
        ColumnValue::Float64(v) => v.to_be_bytes().to_vec(),
        ColumnValue::Boolean(v) => vec![u8::from(*v)],
        ColumnValue::Utf8(v) => v.as_bytes().to_vec(),
        ColumnValue::TimestampMicros(v) => v.to_be_bytes().to_vec(),
        ColumnValue::EnumOrdinal(v) => v.to_be_bytes().to_vec(),
    }
}

/// Decodes a scalar payload per the column's declared type.
pub fn decode_scalar_payload(payload: &[u8], column: &ColumnSchema) -> Result<ColumnValue> {
    match column.column_type {
        ColumnType::Int16 => {
            let bytes = fixed::<2>(payload, column)?;
            Ok(ColumnValue::Int16(i16::from_be_bytes(bytes)))
        }
        ColumnType::Int32 => {
            let bytes = fixed::<4>(payload, column)?;
            Ok(ColumnValue::Int32(i32::from_be_bytes(bytes)))
        }
        ColumnType::Int64 => {
            let bytes = fixed::<8>(payload, column)?;
            Ok(ColumnValue::Int64(i64::from_be_bytes(bytes)))
        }
        ColumnType::Float64 => {
            let bytes = fixed::<8>(payload, column)?;
            Ok(ColumnValue::Float64(f64::from_be_bytes(bytes)))
        }
        ColumnType::Boolean => {
            let bytes = fixed::<1>(payload, column)?;
            Ok(ColumnValue::Boolean(bytes[0] != 0))
        }
        ColumnType::Utf8 => {
            let text = std::str::from_utf8(payload)
                .map_err(|err| anyhow!("invalid utf8 payload for column '{}': {}", column.name, err))?;
            Ok(ColumnValue::Utf8(text.to_string()))
        }
        ColumnType::TimestampMicros => {
            let bytes = fixed::<8>(payload, column)?;
            Ok(ColumnValue::TimestampMicros(i64::from_be_bytes(bytes)))
        }
        ColumnType::Enum => {
            let bytes = fixed::<4>(payload, column)?;
            Ok(ColumnValue::EnumOrdinal(u32::from_be_bytes(bytes)))
        }
    }
}

fn fixed<const N: usize>(payload: &[u8], column: &ColumnSchema) -> Result<[u8; N]> {
    if payload.len() != N {
        return Err(anyhow!(
            "invalid payload length {} for column '{}' (expected {})",
            payload.len(),
            column.name,
            N
        ));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(payload);
    Ok(out)
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    if bytes.len() < *cursor + 2 {
        return Err(anyhow!("buffer underflow while decoding u16"));
    }
    let mut out = [0u8; 2];
    out.copy_from_slice(&bytes[*cursor..*cursor + 2]);
    *cursor += 2;
    Ok(u16::from_be_bytes(out))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    if bytes.len() < *cursor + 4 {
        return Err(anyhow!("buffer underflow while decoding u32"));
    }
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[*cursor..*cursor + 4]);
    *cursor += 4;
    Ok(u32::from_be_bytes(out))
}

fn is_null(bitmap: &[u8], column_idx: usize) -> bool {
    let byte_idx = column_idx / 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] & (1u8 << (column_idx % 8))) != 0
}
