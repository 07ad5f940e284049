//! Contracts the producer consumes from the surrounding tablet server.
//!
//! The producer never touches the storage engine, the consensus log or the
//! catalog directly; it sees them through these traits. Implementations
//! provide their own concurrency; the producer only promises to call them
//! from one request at a time per stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tide_row::schema::TableSchema;
use tide_row::values::ColumnValue;
use tide_row::{HybridTime, OpId, SchemaVersion, TableId, TabletId, TransactionId};

/// One replicated consensus log entry, as surfaced to the CDC reader.
#[derive(Clone, Debug)]
pub enum LogEntry {
    /// A write batch. Transactional batches are skipped by the streamer:
    /// their rows arrive later through the transaction's apply record.
    Write {
        op_id: OpId,
        hybrid_time: HybridTime,
        batch: WriteBatch,
        transactional: bool,
    },
    /// A transaction's intents are ready to materialize.
    TransactionApply {
        op_id: OpId,
        hybrid_time: HybridTime,
        txn_id: TransactionId,
        commit_time: HybridTime,
    },
    /// Schema change (DDL). May correspond to a rejected DDL attempt; the
    /// catalog is authoritative, the entry is a hint.
    ChangeMetadata {
        op_id: OpId,
        hybrid_time: HybridTime,
        schema: TableSchema,
        schema_version: SchemaVersion,
        new_table_name: Option<String>,
    },
    Truncate {
        op_id: OpId,
        hybrid_time: HybridTime,
    },
    /// The tablet was split; verified against the catalog before acting.
    Split {
        op_id: OpId,
        hybrid_time: HybridTime,
    },
    /// Any entry kind the producer does not act on.
    Other {
        op_id: OpId,
        hybrid_time: HybridTime,
    },
}

impl LogEntry {
    pub fn op_id(&self) -> OpId {
        match self {
            LogEntry::Write { op_id, .. }
            | LogEntry::TransactionApply { op_id, .. }
            | LogEntry::ChangeMetadata { op_id, .. }
            | LogEntry::Truncate { op_id, .. }
            | LogEntry::Split { op_id, .. }
            | LogEntry::Other { op_id, .. } => *op_id,
        }
    }

    pub fn hybrid_time(&self) -> HybridTime {
        match self {
            LogEntry::Write { hybrid_time, .. }
            | LogEntry::TransactionApply { hybrid_time, .. }
            | LogEntry::ChangeMetadata { hybrid_time, .. }
            | LogEntry::Truncate { hybrid_time, .. }
            | LogEntry::Split { hybrid_time, .. }
            | LogEntry::Other { hybrid_time, .. } => *hybrid_time,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    pub pairs: Vec<WritePair>,
}

#[derive(Clone, Debug)]
pub struct WritePair {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Result of one log read.
pub struct LogBatch {
    pub entries: Vec<Arc<LogEntry>>,
    pub read_from_disk_bytes: u64,
}

/// One provisional write of a committed-but-being-applied transaction.
#[derive(Clone, Debug)]
pub struct Intent {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub intent_time: HybridTime,
    pub write_id: u32,
    pub reverse_index_key: Vec<u8>,
}

/// Resume position inside a transaction's intent run. An empty key with
/// write id zero is the "start from the beginning" state.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntentResume {
    pub key: Vec<u8>,
    pub write_id: u32,
}

impl IntentResume {
    pub fn is_start(&self) -> bool {
        self.key.is_empty() && self.write_id == 0
    }
}

/// Ordered reader of replicated log entries.
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Reads entries strictly after `from`, bounded by `up_to_index` and the
    /// deadline. Entries are immutable and reference-counted.
    async fn read_after(
        &self,
        from: OpId,
        up_to_index: Option<i64>,
        deadline: Instant,
    ) -> Result<LogBatch>;
}

/// Read-only view of the provisional-intent store.
pub trait IntentStore: Send + Sync {
    /// Returns a run of intents for `txn` starting after `resume`, in
    /// reverse-index-key order, plus the resume state for the next call;
    /// `None` means the transaction's intents are exhausted.
    fn intents_for(
        &self,
        txn: TransactionId,
        resume: &IntentResume,
    ) -> Result<(Vec<Intent>, Option<IntentResume>)>;
}

/// Catalog access for historical schemas and split verification.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Schema valid at `read_time`; `Ok(None)` when the catalog has no
    /// answer for that time.
    async fn table_schema_at(
        &self,
        table_id: TableId,
        read_time: HybridTime,
    ) -> Result<Option<(TableSchema, SchemaVersion)>>;

    /// Number of live tablets whose split parent is `tablet_id`.
    async fn split_children_of(&self, table_id: TableId, tablet_id: TabletId) -> Result<usize>;
}

/// Scan cursor over a consistent snapshot of the tablet.
pub trait SnapshotIterator: Send {
    /// Next row's values in schema column order; `None` when exhausted.
    fn next_row(&mut self) -> Result<Option<Vec<Option<ColumnValue>>>>;

    /// Key the scan would continue from; empty once the scan is complete.
    fn next_scan_key(&mut self) -> Result<Vec<u8>>;
}

/// The tablet peer as the producer sees it.
pub trait TabletHandle: Send + Sync {
    fn tablet_id(&self) -> TabletId;
    fn table_id(&self) -> TableId;
    fn table_name(&self) -> String;

    /// All tables sharing this tablet, the primary one included, as
    /// `(table_id, table_name)` pairs.
    fn colocated_tables(&self) -> Vec<(TableId, String)>;

    /// The schema currently in force on the tablet, with its version.
    fn current_schema(&self) -> (TableSchema, SchemaVersion);

    /// Last replicated log position and its hybrid time.
    fn last_replicated(&self) -> Result<(OpId, HybridTime)>;

    /// Advisory: tells the consensus layer how far this consumer has read.
    fn update_consumer_op_id(&self, op_id: OpId);

    /// Intent-GC retention checkpoint: intents of transactions applied at
    /// or below it may already be gone.
    fn retention_checkpoint(&self) -> OpId;

    /// Extends the intent-GC horizon so a snapshot can keep reading.
    fn pin_intent_retention(&self, op_id: OpId, horizon: Duration);

    /// Releases a previously pinned horizon.
    fn release_intent_retention(&self);

    /// Opens a consistent scan pinned at `read_time` starting at
    /// `start_key` (empty = from the beginning).
    fn snapshot_iterator(
        &self,
        read_time: HybridTime,
        start_key: &[u8],
    ) -> Result<Box<dyn SnapshotIterator>>;
}
