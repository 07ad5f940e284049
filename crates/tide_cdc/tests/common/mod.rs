//! Shared fakes and builders for producer integration tests.
//!
//! Every collaborator contract gets an in-memory implementation with just
//! enough knobs to script the scenarios: the log reader serves a fixed
//! entry list, the intent store can cap its per-call batch to force
//! mid-transaction resumes, and the catalog can be told to fail lookups or
//! report split children.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tide_cdc::tablet::{
    CatalogClient, Intent, IntentResume, IntentStore, LogBatch, LogEntry, LogReader,
    SnapshotIterator, TabletHandle, WriteBatch, WritePair,
};
use tide_cdc::{
    CdcProducer, Checkpoint, EnumLabelMap, GetChangesRequest, GetChangesResponse,
    OptionsProvider, ProducerOptions, Result,
};
use tide_row::keys::{encode_column_key, encode_reverse_index_key, encode_row_key, ColumnRef};
use tide_row::schema::{
    ColumnSchema, ColumnType, TableProperties, TableSchema, PG_OID_INT4, PG_OID_INT8,
};
use tide_row::values::{
    encode_null_low, encode_primitive, encode_scalar_payload, encode_tombstone, ColumnValue,
};
use tide_row::{HybridTime, OpId, SchemaVersion, TableId, TabletId, TransactionId};

pub const TABLET_ID: TabletId = 77;
pub const TABLE_ID: TableId = 5001;
pub const TABLE_NAME: &str = "orders";
pub const STREAM_ID: &str = "stream-1";

/// pk + c1 + c2, the schema most scenarios run against.
pub fn test_schema() -> TableSchema {
    TableSchema {
        schema_name: "public".to_string(),
        columns: vec![
            ColumnSchema {
                column_id: 1,
                name: "pk".to_string(),
                column_type: ColumnType::Int64,
                type_oid: PG_OID_INT8,
                nullable: false,
                is_key: true,
                is_hash_key: true,
            },
            ColumnSchema {
                column_id: 2,
                name: "c1".to_string(),
                column_type: ColumnType::Int32,
                type_oid: PG_OID_INT4,
                nullable: true,
                is_key: false,
                is_hash_key: false,
            },
            ColumnSchema {
                column_id: 3,
                name: "c2".to_string(),
                column_type: ColumnType::Int32,
                type_oid: PG_OID_INT4,
                nullable: true,
                is_key: false,
                is_hash_key: false,
            },
        ],
        properties: TableProperties::default(),
    }
}

/// Same table with one extra column, as after an `ALTER TABLE ... ADD`.
pub fn widened_schema() -> TableSchema {
    let mut schema = test_schema();
    schema.columns.push(ColumnSchema {
        column_id: 4,
        name: "c3".to_string(),
        column_type: ColumnType::Int32,
        type_oid: PG_OID_INT4,
        nullable: true,
        is_key: false,
        is_hash_key: false,
    });
    schema
}

pub fn pk_payloads(row: i64) -> Vec<Option<Vec<u8>>> {
    vec![Some(encode_scalar_payload(&ColumnValue::Int64(row)))]
}

/// Intent writing `column_id = value` on `row`.
pub fn column_intent(
    txn: TransactionId,
    seq: u64,
    row: i64,
    column_id: u32,
    value: i32,
    time: HybridTime,
) -> Intent {
    Intent {
        key: encode_column_key(&pk_payloads(row), ColumnRef::Regular(column_id)),
        value: encode_primitive(&encode_scalar_payload(&ColumnValue::Int32(value))),
        intent_time: time,
        write_id: seq as u32,
        reverse_index_key: encode_reverse_index_key(txn, seq),
    }
}

/// Liveness-cell intent opening a row insert.
pub fn liveness_intent(txn: TransactionId, seq: u64, row: i64, time: HybridTime) -> Intent {
    Intent {
        key: encode_column_key(&pk_payloads(row), ColumnRef::System(0)),
        value: encode_null_low(),
        intent_time: time,
        write_id: seq as u32,
        reverse_index_key: encode_reverse_index_key(txn, seq),
    }
}

/// Whole-row tombstone intent.
pub fn delete_intent(txn: TransactionId, seq: u64, row: i64, time: HybridTime) -> Intent {
    Intent {
        key: encode_row_key(&pk_payloads(row)),
        value: encode_tombstone(),
        intent_time: time,
        write_id: seq as u32,
        reverse_index_key: encode_reverse_index_key(txn, seq),
    }
}

/// Non-transactional write pair setting `column_id = value` on `row`.
pub fn write_pair(row: i64, column_id: u32, value: i32) -> WritePair {
    WritePair {
        key: encode_column_key(&pk_payloads(row), ColumnRef::Regular(column_id)),
        value: encode_primitive(&encode_scalar_payload(&ColumnValue::Int32(value))),
    }
}

pub fn apply_entry(op: OpId, txn: TransactionId, commit_time: HybridTime) -> LogEntry {
    LogEntry::TransactionApply {
        op_id: op,
        hybrid_time: commit_time,
        txn_id: txn,
        commit_time,
    }
}

pub fn write_entry(op: OpId, time: HybridTime, pairs: Vec<WritePair>) -> LogEntry {
    LogEntry::Write {
        op_id: op,
        hybrid_time: time,
        batch: WriteBatch { pairs },
        transactional: false,
    }
}

pub fn other_entry(op: OpId, time: HybridTime) -> LogEntry {
    LogEntry::Other {
        op_id: op,
        hybrid_time: time,
    }
}

// ---------------------------------------------------------------------------
// Fake collaborators
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLog {
    entries: Mutex<Vec<Arc<LogEntry>>>,
    /// Entries handed out per read; small values exercise re-fetch loops.
    pub batch_limit: Mutex<usize>,
}

impl FakeLog {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeLog {
            entries: Mutex::new(Vec::new()),
            batch_limit: Mutex::new(usize::MAX),
        })
    }

    pub fn push(&self, entry: LogEntry) {
        self.entries.lock().unwrap().push(Arc::new(entry));
    }

    pub fn max_index(&self) -> Option<i64> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.op_id().index)
            .max()
    }
}

#[async_trait]
impl LogReader for FakeLog {
    async fn read_after(
        &self,
        from: OpId,
        up_to_index: Option<i64>,
        _deadline: Instant,
    ) -> anyhow::Result<LogBatch> {
        let limit = *self.batch_limit.lock().unwrap();
        let entries: Vec<_> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.op_id() > from)
            .filter(|e| up_to_index.map_or(true, |bound| e.op_id().index <= bound))
            .take(limit)
            .cloned()
            .collect();
        let bytes = entries.len() as u64 * 64;
        Ok(LogBatch {
            entries,
            read_from_disk_bytes: bytes,
        })
    }
}

#[derive(Default)]
pub struct FakeIntentStore {
    intents: Mutex<HashMap<TransactionId, Vec<Intent>>>,
    /// Intents returned per call; small values force mid-transaction resumes.
    pub batch_limit: Mutex<usize>,
}

impl FakeIntentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeIntentStore {
            intents: Mutex::new(HashMap::new()),
            batch_limit: Mutex::new(usize::MAX),
        })
    }

    pub fn insert(&self, txn: TransactionId, mut intents: Vec<Intent>) {
        intents.sort_by(|a, b| a.reverse_index_key.cmp(&b.reverse_index_key));
        self.intents.lock().unwrap().insert(txn, intents);
    }

    pub fn clear(&self) {
        self.intents.lock().unwrap().clear();
    }
}

impl IntentStore for FakeIntentStore {
    fn intents_for(
        &self,
        txn: TransactionId,
        resume: &IntentResume,
    ) -> anyhow::Result<(Vec<Intent>, Option<IntentResume>)> {
        let limit = *self.batch_limit.lock().unwrap();
        let guard = self.intents.lock().unwrap();
        let all = guard.get(&txn).cloned().unwrap_or_default();
        let remaining: Vec<_> = all
            .into_iter()
            .filter(|i| resume.is_start() || i.reverse_index_key > resume.key)
            .collect();
        if remaining.len() > limit {
            let batch: Vec<_> = remaining[..limit].to_vec();
            let last = batch.last().expect("non-empty batch");
            let next = IntentResume {
                key: last.reverse_index_key.clone(),
                write_id: last.write_id,
            };
            Ok((batch, Some(next)))
        } else {
            Ok((remaining, None))
        }
    }
}

pub struct FakeCatalog {
    /// `(valid_from, schema, version)`, newest last.
    schemas: Mutex<Vec<(HybridTime, TableSchema, SchemaVersion)>>,
    pub fail_lookups: AtomicBool,
    pub split_children: Mutex<usize>,
}

impl FakeCatalog {
    pub fn new(schema: TableSchema, version: SchemaVersion) -> Arc<Self> {
        Arc::new(FakeCatalog {
            schemas: Mutex::new(vec![(HybridTime::MIN, schema, version)]),
            fail_lookups: AtomicBool::new(false),
            split_children: Mutex::new(0),
        })
    }

    pub fn add_version(&self, valid_from: HybridTime, schema: TableSchema, version: SchemaVersion) {
        let mut guard = self.schemas.lock().unwrap();
        guard.push((valid_from, schema, version));
        guard.sort_by_key(|(from, _, _)| *from);
    }
}

#[async_trait]
impl CatalogClient for FakeCatalog {
    async fn table_schema_at(
        &self,
        _table_id: TableId,
        read_time: HybridTime,
    ) -> anyhow::Result<Option<(TableSchema, SchemaVersion)>> {
        if self.fail_lookups.load(Ordering::Relaxed) {
            anyhow::bail!("catalog unavailable");
        }
        let guard = self.schemas.lock().unwrap();
        Ok(guard
            .iter()
            .rev()
            .find(|(from, _, _)| *from <= read_time)
            .map(|(_, schema, version)| (schema.clone(), *version)))
    }

    async fn split_children_of(
        &self,
        _table_id: TableId,
        _tablet_id: TabletId,
    ) -> anyhow::Result<usize> {
        Ok(*self.split_children.lock().unwrap())
    }
}

/// One snapshot row: scan key plus values in schema column order.
#[derive(Clone)]
pub struct SnapshotRow {
    pub key: Vec<u8>,
    pub values: Vec<Option<ColumnValue>>,
}

pub struct FakeTablet {
    pub schema: Mutex<(TableSchema, SchemaVersion)>,
    pub last_replicated: Mutex<(OpId, HybridTime)>,
    pub retention_checkpoint: Mutex<OpId>,
    pub pinned_retention: Mutex<Option<(OpId, Duration)>>,
    pub consumer_op_id: Mutex<Option<OpId>>,
    pub snapshot_rows: Mutex<Vec<SnapshotRow>>,
}

impl FakeTablet {
    pub fn new(schema: TableSchema, version: SchemaVersion) -> Arc<Self> {
        Arc::new(FakeTablet {
            schema: Mutex::new((schema, version)),
            last_replicated: Mutex::new((OpId::new(1, 1), HybridTime::from_micros(1_000))),
            retention_checkpoint: Mutex::new(OpId::invalid()),
            pinned_retention: Mutex::new(None),
            consumer_op_id: Mutex::new(None),
            snapshot_rows: Mutex::new(Vec::new()),
        })
    }

    pub fn set_snapshot_rows(&self, mut rows: Vec<SnapshotRow>) {
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        *self.snapshot_rows.lock().unwrap() = rows;
    }
}

struct FakeSnapshotIterator {
    rows: Vec<SnapshotRow>,
    pos: usize,
    consumed_any: bool,
}

impl SnapshotIterator for FakeSnapshotIterator {
    fn next_row(&mut self) -> anyhow::Result<Option<Vec<Option<ColumnValue>>>> {
        if self.pos >= self.rows.len() {
            return Ok(None);
        }
        let row = self.rows[self.pos].values.clone();
        self.pos += 1;
        self.consumed_any = true;
        Ok(Some(row))
    }

    fn next_scan_key(&mut self) -> anyhow::Result<Vec<u8>> {
        if self.pos < self.rows.len() {
            return Ok(self.rows[self.pos].key.clone());
        }
        // Page-style resume key: the successor of the last row served. A
        // scan starting there comes back empty, which is how the producer
        // discovers the end of the table.
        if self.consumed_any {
            let mut key = self.rows[self.pos - 1].key.clone();
            key.push(0x00);
            return Ok(key);
        }
        Ok(Vec::new())
    }
}

impl TabletHandle for FakeTablet {
    fn tablet_id(&self) -> TabletId {
        TABLET_ID
    }

    fn table_id(&self) -> TableId {
        TABLE_ID
    }

    fn table_name(&self) -> String {
        TABLE_NAME.to_string()
    }

    fn colocated_tables(&self) -> Vec<(TableId, String)> {
        vec![(TABLE_ID, TABLE_NAME.to_string())]
    }

    fn current_schema(&self) -> (TableSchema, SchemaVersion) {
        self.schema.lock().unwrap().clone()
    }

    fn last_replicated(&self) -> anyhow::Result<(OpId, HybridTime)> {
        Ok(*self.last_replicated.lock().unwrap())
    }

    fn update_consumer_op_id(&self, op_id: OpId) {
        *self.consumer_op_id.lock().unwrap() = Some(op_id);
    }

    fn retention_checkpoint(&self) -> OpId {
        *self.retention_checkpoint.lock().unwrap()
    }

    fn pin_intent_retention(&self, op_id: OpId, horizon: Duration) {
        *self.pinned_retention.lock().unwrap() = Some((op_id, horizon));
    }

    fn release_intent_retention(&self) {
        *self.pinned_retention.lock().unwrap() = None;
    }

    fn snapshot_iterator(
        &self,
        _read_time: HybridTime,
        start_key: &[u8],
    ) -> anyhow::Result<Box<dyn SnapshotIterator>> {
        let rows: Vec<_> = self
            .snapshot_rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.key.as_slice() >= start_key)
            .cloned()
            .collect();
        Ok(Box::new(FakeSnapshotIterator {
            rows,
            pos: 0,
            consumed_any: false,
        }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub tablet: Arc<FakeTablet>,
    pub log: Arc<FakeLog>,
    pub intents: Arc<FakeIntentStore>,
    pub catalog: Arc<FakeCatalog>,
    pub producer: CdcProducer,
    pub enum_labels: EnumLabelMap,
}

/// Installs a fmt subscriber once so `RUST_LOG` works in test runs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(ProducerOptions::default())
    }

    pub fn with_options(options: ProducerOptions) -> Self {
        init_tracing();
        let schema = test_schema();
        let tablet = FakeTablet::new(schema.clone(), 1);
        let log = FakeLog::new();
        let intents = FakeIntentStore::new();
        let catalog = FakeCatalog::new(schema, 1);
        let producer = CdcProducer::new(
            tablet.clone(),
            log.clone(),
            intents.clone(),
            catalog.clone(),
            OptionsProvider::fixed(options),
        );
        Harness {
            tablet,
            log,
            intents,
            catalog,
            producer,
            enum_labels: EnumLabelMap::new(),
        }
    }

    pub async fn get_changes(&self, checkpoint: Checkpoint) -> Result<GetChangesResponse> {
        let request = GetChangesRequest {
            stream_id: STREAM_ID.to_string(),
            tablet_id: TABLET_ID,
            checkpoint,
            last_readable_op_index: self.log.max_index(),
        };
        self.producer
            .get_changes(
                &request,
                &self.enum_labels,
                Instant::now() + Duration::from_secs(10),
            )
            .await
    }

    /// Streams one request with a warmed schema cache: the first call of a
    /// session emits the colocated DDL records, which most scenarios want
    /// out of the way.
    pub async fn warm_schema(&self) -> Checkpoint {
        let warm_op = OpId::new(1, 1);
        self.log
            .push(other_entry(warm_op, HybridTime::from_micros(100)));
        let response = self
            .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
            .await
            .expect("warm-up request");
        assert_eq!(response.checkpoint.op_id(), warm_op);
        response.checkpoint
    }
}
