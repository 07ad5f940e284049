//! Encoded row-key and intent reverse-index-key formats.
//!
//! A row key is the primary-key tuple followed by a group-end marker and at
//! most one column entry. The prefix up to and including the group end is
//! the row fingerprint: every cell of one row shares it, which is what the
//! CDC producer uses to group write pairs into row events.

use anyhow::{anyhow, Result};

use crate::schema::ColumnId;
use crate::TransactionId;

/// Marker for a NULL primary-key component.
pub const KEY_NULL_MARKER: u8 = 0x00;
/// Marker for a present primary-key component, followed by a length-prefixed payload.
pub const KEY_NOT_NULL_MARKER: u8 = 0x01;
/// Terminates the primary-key tuple.
pub const KEY_GROUP_END: u8 = 0x21;
/// Tags a regular column-id entry after the group end.
pub const KEY_TAG_COLUMN_ID: u8 = 0x4b;
/// Tags a system column-id entry (liveness cell) after the group end.
pub const KEY_TAG_SYSTEM_COLUMN_ID: u8 = 0x53;
/// Leading tag of an intent reverse-index key.
pub const REVERSE_KEY_TAG_TXN: u8 = 0x54;

/// Classified column entry of a decoded row key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnRef {
    /// No column entry: the key addresses the row itself.
    None,
    Regular(ColumnId),
    System(ColumnId),
}

impl ColumnRef {
    pub fn column_id(self) -> Option<ColumnId> {
        match self {
            ColumnRef::None => None,
            ColumnRef::Regular(id) | ColumnRef::System(id) => Some(id),
        }
    }
}

/// Result of decoding one encoded row key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedRowKey {
    /// Byte length of the row fingerprint (primary-key tuple + group end).
    pub fingerprint_len: usize,
    /// Primary-key component payloads in declaration order; `None` is NULL.
    pub pk_payloads: Vec<Option<Vec<u8>>>,
    pub column: ColumnRef,
}

impl DecodedRowKey {
    /// Number of sub-key entries after the primary key.
    pub fn num_subkeys(&self) -> usize {
        match self.column {
            ColumnRef::None => 0,
            _ => 1,
        }
    }
}

/// Encodes a row key from primary-key payloads, without a column entry.
pub fn encode_row_key(pk_payloads: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut out = Vec::new();
    for payload in pk_payloads {
        match payload {
            None => out.push(KEY_NULL_MARKER),
            Some(payload) => {
                out.push(KEY_NOT_NULL_MARKER);
                out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
                out.extend_from_slice(payload);
            }
        }
    }
    out.push(KEY_GROUP_END);
    out
}

/// Encodes a row key addressing one column of the row.
pub fn encode_column_key(pk_payloads: &[Option<Vec<u8>>], column: ColumnRef) -> Vec<u8> {
    let mut out = encode_row_key(pk_payloads);
    match column {
        ColumnRef::None => {}
        ColumnRef::Regular(id) => {
            out.push(KEY_TAG_COLUMN_ID);
            out.extend_from_slice(&id.to_be_bytes());
        }
        ColumnRef::System(id) => {
            out.push(KEY_TAG_SYSTEM_COLUMN_ID);
            out.extend_from_slice(&id.to_be_bytes());
        }
    }
    out
}

/// Decodes an encoded row key into its fingerprint, primary-key payloads and
/// column entry.
pub fn decode_row_key(key: &[u8]) -> Result<DecodedRowKey> {
    let mut cursor = 0usize;
    let mut pk_payloads = Vec::new();

    loop {
        let marker = *key
            .get(cursor)
            .ok_or_else(|| anyhow!("row key truncated before group end: {}", hex::encode(key)))?;
        cursor += 1;
        match marker {
            KEY_GROUP_END => break,
            KEY_NULL_MARKER => pk_payloads.push(None),
            KEY_NOT_NULL_MARKER => {
                let len = read_u32(key, &mut cursor)? as usize;
                if key.len() < cursor + len {
                    return Err(anyhow!(
                        "row key truncated while decoding pk payload: {}",
                        hex::encode(key)
                    ));
                }
                pk_payloads.push(Some(key[cursor..cursor + len].to_vec()));
                cursor += len;
            }
            other => {
                return Err(anyhow!(
                    "invalid row key marker {:#04x} in key {}",
                    other,
                    hex::encode(key)
                ));
            }
        }
    }

    let fingerprint_len = cursor;
    let column = match key.get(cursor) {
        None => ColumnRef::None,
        Some(&KEY_TAG_COLUMN_ID) => {
            cursor += 1;
            ColumnRef::Regular(read_u32(key, &mut cursor)?)
        }
        Some(&KEY_TAG_SYSTEM_COLUMN_ID) => {
            cursor += 1;
            ColumnRef::System(read_u32(key, &mut cursor)?)
        }
        Some(&other) => {
            return Err(anyhow!(
                "invalid column entry tag {:#04x} in key {}",
                other,
                hex::encode(key)
            ));
        }
    };
    if cursor != key.len() {
        return Err(anyhow!("trailing bytes after column entry in key {}", hex::encode(key)));
    }

    Ok(DecodedRowKey {
        fingerprint_len,
        pk_payloads,
        column,
    })
}

/// Encodes an intent reverse-index key. Keys of one transaction sort by
/// `seq`, which equals the transaction's logical write order.
pub fn encode_reverse_index_key(txn: TransactionId, seq: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 8 + 8);
    out.push(REVERSE_KEY_TAG_TXN);
    out.extend_from_slice(&txn.node_id.to_be_bytes());
    out.extend_from_slice(&txn.counter.to_be_bytes());
    out.extend_from_slice(&seq.to_be_bytes());
    out
}

/// Decodes a reverse-index key back into its transaction id and sequence.
pub fn decode_reverse_index_key(key: &[u8]) -> Result<(TransactionId, u64)> {
    if key.len() != 1 + 8 + 8 + 8 {
        return Err(anyhow!(
            "reverse index key has invalid length {}: {}",
            key.len(),
            hex::encode(key)
        ));
    }
    if key[0] != REVERSE_KEY_TAG_TXN {
        return Err(anyhow!(
            "reverse index key has invalid tag {:#04x}: {}",
            key[0],
            hex::encode(key)
        ));
    }
    let mut cursor = 1usize;
    let node_id = read_u64(key, &mut cursor)?;
    let counter = read_u64(key, &mut cursor)?;
    let seq = read_u64(key, &mut cursor)?;
    Ok((TransactionId { node_id, counter }, seq))
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

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    if bytes.len() < *cursor + 8 {
        return Err(anyhow!("buffer underflow while decoding u64"));
    }
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[*cursor..*cursor + 8]);
    *cursor += 8;
    Ok(u64::from_be_bytes(out))
}
