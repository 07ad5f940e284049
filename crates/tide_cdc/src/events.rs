//! Wire-visible event and request/response shapes.
//!
//! A response is a list of `{op_id, row}` record envelopes plus the updated
//! checkpoint. The shapes here are stable: consumers across versions decode
//! them, so fields are only ever added.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tide_row::schema::{ColumnSchema, TableProperties};
use tide_row::values::ColumnValue;
use tide_row::{HybridTime, OpId, SchemaVersion, TabletId, TransactionId};

use crate::checkpoint::Checkpoint;
use crate::error::TerminalStatus;

/// Opaque identifier of one CDC stream (assigned by the stream registry).
pub type StreamId = String;

/// Enum type OID to ordered label list, provided by the host per request.
pub type EnumLabelMap = HashMap<u32, Vec<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Begin,
    Commit,
    Insert,
    Update,
    Delete,
    Read,
    Ddl,
    Truncate,
}

/// One typed column value on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub column_name: String,
    pub column_type_oid: u32,
    /// `None` is an explicit SQL NULL. An absent tuple slot (the
    /// surrounding `Option<Datum>`) is a placeholder instead: a column the
    /// event does not cover.
    pub value: Option<ColumnValue>,
}

/// Column metadata carried on DDL events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub type_oid: u32,
    pub is_key: bool,
    pub is_hash_key: bool,
    pub is_nullable: bool,
}

impl ColumnInfo {
    pub fn from_schema(column: &ColumnSchema) -> Self {
        ColumnInfo {
            name: column.name.clone(),
            type_oid: column.type_oid,
            is_key: column.is_key,
            is_hash_key: column.is_hash_key,
            is_nullable: column.nullable,
        }
    }
}

/// Schema payload of a DDL event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DdlSchemaInfo {
    pub columns: Vec<ColumnInfo>,
    pub properties: TableProperties,
}

/// The logical unit of output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowEvent {
    pub kind: EventKind,
    pub table: String,
    pub schema_name: String,
    pub transaction_id: Option<TransactionId>,
    pub commit_time: Option<HybridTime>,
    pub old_tuple: Vec<Option<Datum>>,
    pub new_tuple: Vec<Option<Datum>>,
    /// DDL events only.
    pub schema: Option<DdlSchemaInfo>,
    pub schema_version: Option<SchemaVersion>,
    pub new_table_name: Option<String>,
}

impl RowEvent {
    pub fn new(kind: EventKind, table: &str, schema_name: &str) -> Self {
        RowEvent {
            kind,
            table: table.to_string(),
            schema_name: schema_name.to_string(),
            transaction_id: None,
            commit_time: None,
            old_tuple: Vec::new(),
            new_tuple: Vec::new(),
            schema: None,
            schema_version: None,
            new_table_name: None,
        }
    }

    /// Appends one datum, routed by event kind: deletes fill the old tuple,
    /// everything else the new one. The opposite tuple gets a placeholder so
    /// both stay the same length.
    pub fn push_datum(&mut self, datum: Datum) {
        if self.kind == EventKind::Delete {
            self.old_tuple.push(Some(datum));
            self.new_tuple.push(None);
        } else {
            self.new_tuple.push(Some(datum));
            self.old_tuple.push(None);
        }
    }

    /// Rough wire footprint, used for consumption accounting.
    pub fn approx_size(&self) -> u64 {
        let tuple_size = |tuple: &Vec<Option<Datum>>| -> u64 {
            tuple
                .iter()
                .flatten()
                .map(|d| {
                    let value_len = match &d.value {
                        Some(ColumnValue::Utf8(s)) => s.len() as u64,
                        Some(_) => 8,
                        None => 0,
                    };
                    d.column_name.len() as u64 + 4 + value_len
                })
                .sum()
        };
        let schema_size = self
            .schema
            .as_ref()
            .map(|s| s.columns.iter().map(|c| c.name.len() as u64 + 16).sum())
            .unwrap_or(0u64);
        self.table.len() as u64
            + self.schema_name.len() as u64
            + 32
            + tuple_size(&self.old_tuple)
            + tuple_size(&self.new_tuple)
            + schema_size
    }
}

/// Per-event locator: the log position plus, for intent-derived events, the
/// write id and reverse-index key of the last intent folded in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventOpId {
    pub term: i64,
    pub index: i64,
    pub write_id: u32,
    pub write_id_key: Vec<u8>,
}

impl EventOpId {
    pub fn at(op_id: OpId) -> Self {
        EventOpId {
            term: op_id.term,
            index: op_id.index,
            write_id: 0,
            write_id_key: Vec::new(),
        }
    }

    pub fn with_intent(op_id: OpId, write_id: u32, write_id_key: Vec<u8>) -> Self {
        EventOpId {
            term: op_id.term,
            index: op_id.index,
            write_id,
            write_id_key,
        }
    }
}

/// Record envelope as it appears in a response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub op_id: EventOpId,
    pub row: RowEvent,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetChangesRequest {
    pub stream_id: StreamId,
    pub tablet_id: TabletId,
    pub checkpoint: Checkpoint,
    /// Upper bound on readable log indexes, supplied by the host from the
    /// consensus layer; `None` means "no bound".
    pub last_readable_op_index: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetChangesResponse {
    pub records: Vec<ChangeRecord>,
    pub checkpoint: Checkpoint,
    /// Last log position fully streamed; feeds host-side lag metrics.
    pub streamed_op_id: Option<OpId>,
    pub terminal_status: TerminalStatus,
}
