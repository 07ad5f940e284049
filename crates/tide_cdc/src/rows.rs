//! Groups runs of key/value cells into logical row events.
//!
//! Cells of one row share the encoded-key fingerprint. The assembler walks
//! cells in order, decides `INSERT` vs `UPDATE` vs `DELETE` from the first
//! cell of each row, and, in packed-update mode, folds successive column
//! writes of one row into a single `UPDATE`. The locator attached to a
//! flushed event is that of the last cell folded into it, so a resume never
//! re-emits columns the event already covered.

use tide_row::keys::{decode_row_key, ColumnRef, DecodedRowKey};
use tide_row::schema::TableSchema;
use tide_row::values::{decode_value, DecodedValue};
use tide_row::{HybridTime, OpId, TransactionId};
use tracing::warn;

use crate::datum::datum_for_column;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, EnumLabelMap, EventKind, EventOpId, RowEvent};
use crate::tablet::{Intent, IntentResume, WriteBatch};

/// Shared inputs for one assembly run.
pub struct RowContext<'a> {
    pub schema: &'a TableSchema,
    pub table_name: &'a str,
    pub enum_labels: &'a EnumLabelMap,
    pub op_id: OpId,
    pub transaction_id: Option<TransactionId>,
    pub commit_time: Option<HybridTime>,
}

impl<'a> RowContext<'a> {
    fn value_column_count(&self) -> usize {
        self.schema.num_columns() - self.schema.num_key_columns()
    }
}

/// Accumulator for intent runs of one transaction.
pub struct RowAssembler<'a> {
    ctx: RowContext<'a>,
    packed_updates: bool,
    prev_fingerprint: Vec<u8>,
    prev_physical_micros: u64,
    col_count: usize,
    pending: Option<RowEvent>,
    /// Write id + reverse-index key of the last intent folded into `pending`.
    last_locator: (u32, Vec<u8>),
}

impl<'a> RowAssembler<'a> {
    pub fn new(ctx: RowContext<'a>, packed_updates: bool) -> Self {
        RowAssembler {
            ctx,
            packed_updates,
            prev_fingerprint: Vec::new(),
            prev_physical_micros: 0,
            col_count: 0,
            pending: None,
            last_locator: (0, Vec::new()),
        }
    }

    /// Feeds one intent. Emitted events land in `out`; `resume` tracks the
    /// locator the next request would continue from.
    pub fn push_intent(
        &mut self,
        intent: &Intent,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
    ) -> Result<()> {
        let decoded_key = decode_row_key(&intent.key).map_err(CdcError::corrupt)?;
        let decoded_value = decode_value(&intent.value, self.ctx.value_column_count())
            .map_err(CdcError::corrupt)?;

        // Primary-key column cells carry no new information: the key itself
        // already materializes the primary key.
        if let ColumnRef::Regular(id) = decoded_key.column {
            if self.ctx.schema.is_key_column(id) {
                resume.write_id = intent.write_id;
                resume.key = intent.reverse_index_key.clone();
                return Ok(());
            }
        }

        let fingerprint = &intent.key[..decoded_key.fingerprint_len];
        let root_tombstone = decoded_value.is_tombstone() && decoded_key.num_subkeys() == 0;
        let num_columns = self.ctx.schema.num_columns();

        let new_event_needed = if self.packed_updates {
            self.prev_fingerprint != fingerprint
                || self.col_count >= num_columns
                || root_tombstone
                || self.prev_physical_micros != intent.intent_time.physical_micros()
        } else {
            self.prev_fingerprint != fingerprint || self.col_count >= num_columns
        };

        if new_event_needed {
            self.open_event(&decoded_key, &decoded_value, root_tombstone, out, resume)?;
        }

        self.prev_fingerprint = fingerprint.to_vec();
        self.prev_physical_micros = intent.intent_time.physical_micros();

        self.accumulate(&decoded_key, decoded_value, out, resume, intent)?;
        Ok(())
    }

    /// Flushes a pending packed `UPDATE` at the end of the intent run.
    pub fn finish(
        &mut self,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
    ) -> Result<()> {
        if self.packed_updates {
            self.flush_pending_update(out, resume);
        }
        Ok(())
    }

    /// Opens the event for a new row (or a new event of the same row after
    /// saturation, a tombstone or a physical-time jump). The pending packed
    /// `UPDATE` is flushed first, then the column counter resets.
    fn open_event(
        &mut self,
        decoded_key: &DecodedRowKey,
        decoded_value: &DecodedValue,
        root_tombstone: bool,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
    ) -> Result<()> {
        if self.packed_updates {
            self.flush_pending_update(out, resume);
        } else {
            self.pending = None;
        }
        self.col_count = 0;

        let num_columns = self.ctx.schema.num_columns();
        let kind = if root_tombstone {
            if !self.packed_updates {
                self.col_count = num_columns;
            }
            EventKind::Delete
        } else if matches!(decoded_key.column, ColumnRef::System(_))
            && matches!(decoded_value, DecodedValue::NullLow)
        {
            self.col_count = self.ctx.schema.num_key_columns() - 1;
            EventKind::Insert
        } else if decoded_key.column == ColumnRef::None
            && matches!(decoded_value, DecodedValue::PackedRow(_))
        {
            // A packed row is the full image of a freshly written row.
            self.col_count = self.ctx.schema.num_key_columns() - 1;
            EventKind::Insert
        } else {
            if !self.packed_updates {
                self.col_count = num_columns;
            }
            EventKind::Update
        };

        let mut event = RowEvent::new(kind, self.ctx.table_name, &self.ctx.schema.schema_name);
        event.transaction_id = self.ctx.transaction_id;
        event.commit_time = self.ctx.commit_time;
        self.add_primary_key(&mut event, decoded_key)?;
        self.pending = Some(event);
        Ok(())
    }

    fn accumulate(
        &mut self,
        decoded_key: &DecodedRowKey,
        decoded_value: DecodedValue,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
        intent: &Intent,
    ) -> Result<()> {
        let num_columns = self.ctx.schema.num_columns();
        let is_insert_or_update = matches!(
            self.pending.as_ref().map(|e| e.kind),
            Some(EventKind::Insert) | Some(EventKind::Update)
        );

        if is_insert_or_update {
            let packed_image = decoded_key.column == ColumnRef::None
                && matches!(decoded_value, DecodedValue::PackedRow(_));
            if packed_image {
                self.col_count = num_columns;
            } else if self.packed_updates {
                self.col_count += 1;
            } else if self.pending.as_ref().map(|e| e.kind) == Some(EventKind::Insert) {
                self.col_count += 1;
            }

            let schema = self.ctx.schema;
            let enum_labels = self.ctx.enum_labels;
            if let Some(pending) = self.pending.as_mut() {
                match (decoded_key.column, decoded_value) {
                    (ColumnRef::Regular(id), DecodedValue::Primitive(payload)) => {
                        let column = schema.column_by_id(id).map_err(CdcError::Internal)?;
                        let datum = datum_for_column(column, Some(&payload), enum_labels)?;
                        pending.push_datum(datum);
                    }
                    // A cell-level tombstone or null-low clears the column.
                    (ColumnRef::Regular(id), DecodedValue::Tombstone)
                    | (ColumnRef::Regular(id), DecodedValue::NullLow) => {
                        let column = schema.column_by_id(id).map_err(CdcError::Internal)?;
                        let datum = datum_for_column(column, None, enum_labels)?;
                        pending.push_datum(datum);
                    }
                    (ColumnRef::Regular(_), DecodedValue::PackedRow(_)) => {
                        return Err(CdcError::corrupt(anyhow::anyhow!(
                            "packed row value addressed at a single column"
                        )));
                    }
                    (ColumnRef::None, DecodedValue::PackedRow(payloads)) => {
                        let value_columns = schema.columns.iter().filter(|c| !c.is_key);
                        for (column, payload) in value_columns.zip(payloads.iter()) {
                            let datum =
                                datum_for_column(column, payload.as_deref(), enum_labels)?;
                            pending.push_datum(datum);
                        }
                    }
                    (ColumnRef::System(_), _) => {}
                    (ColumnRef::None, _) => {
                        warn!(
                            table = self.ctx.table_name,
                            "row-level value without column entry is not a tombstone or packed row"
                        );
                    }
                }
            }
        }

        // Emission rules. Saturated inserts and deletes close immediately
        // with this intent's locator; packed updates stay open and remember
        // the locator for a later flush.
        let kind = self.pending.as_ref().map(|e| e.kind);
        if self.packed_updates {
            match kind {
                Some(EventKind::Insert) if self.col_count == num_columns => {
                    self.emit_with_intent(intent, out, resume);
                    self.col_count = num_columns;
                }
                Some(EventKind::Delete) => {
                    self.emit_with_intent(intent, out, resume);
                    self.col_count = num_columns;
                }
                Some(EventKind::Update) => {
                    self.last_locator = (intent.write_id, intent.reverse_index_key.clone());
                }
                _ => {}
            }
        } else {
            match kind {
                Some(EventKind::Insert) if self.col_count == num_columns => {
                    self.emit_with_intent(intent, out, resume);
                }
                Some(EventKind::Update) | Some(EventKind::Delete) => {
                    self.emit_with_intent(intent, out, resume);
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn add_primary_key(&mut self, event: &mut RowEvent, decoded_key: &DecodedRowKey) -> Result<()> {
        for (idx, payload) in decoded_key.pk_payloads.iter().enumerate() {
            let column = self.ctx.schema.column(idx).map_err(CdcError::Internal)?;
            let datum = datum_for_column(column, payload.as_deref(), self.ctx.enum_labels)?;
            event.push_datum(datum);
        }
        Ok(())
    }

    fn emit_with_intent(
        &mut self,
        intent: &Intent,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
    ) {
        if let Some(row) = self.pending.take() {
            self.emit(row, intent.write_id, intent.reverse_index_key.clone(), out, resume);
        }
    }

    fn flush_pending_update(&mut self, out: &mut Vec<ChangeRecord>, resume: &mut IntentResume) {
        let is_update = self
            .pending
            .as_ref()
            .is_some_and(|e| e.kind == EventKind::Update);
        if is_update {
            if let Some(row) = self.pending.take() {
                let (write_id, key) = self.last_locator.clone();
                self.emit(row, write_id, key, out, resume);
            }
        }
    }

    fn emit(
        &mut self,
        row: RowEvent,
        write_id: u32,
        write_id_key: Vec<u8>,
        out: &mut Vec<ChangeRecord>,
        resume: &mut IntentResume,
    ) {
        resume.write_id = write_id;
        resume.key = write_id_key.clone();
        out.push(ChangeRecord {
            op_id: EventOpId::with_intent(self.ctx.op_id, write_id, write_id_key),
            row,
        });
    }
}

/// Assembles a non-transactional write batch: one event per row, grouped by
/// key fingerprint only. The batch is already the post-image of each row, so
/// there is no packed-update accumulation and no `BEGIN`/`COMMIT` bracket.
pub fn assemble_write_batch(
    ctx: &RowContext<'_>,
    batch: &WriteBatch,
    out: &mut Vec<ChangeRecord>,
) -> Result<()> {
    let mut prev_fingerprint: Vec<u8> = Vec::new();
    let mut pending: Option<RowEvent> = None;

    for pair in &batch.pairs {
        let decoded_key = decode_row_key(&pair.key).map_err(CdcError::corrupt)?;
        let decoded_value =
            decode_value(&pair.value, ctx.value_column_count()).map_err(CdcError::corrupt)?;
        let fingerprint = &pair.key[..decoded_key.fingerprint_len];
        let root_tombstone = decoded_value.is_tombstone() && decoded_key.num_subkeys() == 0;

        if prev_fingerprint != fingerprint {
            if let Some(row) = pending.take() {
                out.push(ChangeRecord {
                    op_id: EventOpId::at(ctx.op_id),
                    row,
                });
            }

            let kind = if root_tombstone {
                EventKind::Delete
            } else if matches!(decoded_key.column, ColumnRef::System(_))
                && matches!(decoded_value, DecodedValue::NullLow)
            {
                EventKind::Insert
            } else if decoded_key.column == ColumnRef::None
                && matches!(decoded_value, DecodedValue::PackedRow(_))
            {
                EventKind::Insert
            } else {
                EventKind::Update
            };

            let mut event = RowEvent::new(kind, ctx.table_name, &ctx.schema.schema_name);
            event.commit_time = ctx.commit_time;
            for (idx, payload) in decoded_key.pk_payloads.iter().enumerate() {
                let column = ctx.schema.column(idx).map_err(CdcError::Internal)?;
                let datum = datum_for_column(column, payload.as_deref(), ctx.enum_labels)?;
                event.push_datum(datum);
            }
            pending = Some(event);
        }
        prev_fingerprint = fingerprint.to_vec();

        let is_insert_or_update = matches!(
            pending.as_ref().map(|e| e.kind),
            Some(EventKind::Insert) | Some(EventKind::Update)
        );
        if is_insert_or_update {
            if let Some(event) = pending.as_mut() {
                match (decoded_key.column, decoded_value) {
                    (ColumnRef::Regular(id), DecodedValue::Primitive(payload)) => {
                        let column = ctx.schema.column_by_id(id).map_err(CdcError::Internal)?;
                        let datum = datum_for_column(column, Some(&payload), ctx.enum_labels)?;
                        event.push_datum(datum);
                    }
                    (ColumnRef::Regular(id), DecodedValue::Tombstone)
                    | (ColumnRef::Regular(id), DecodedValue::NullLow) => {
                        let column = ctx.schema.column_by_id(id).map_err(CdcError::Internal)?;
                        let datum = datum_for_column(column, None, ctx.enum_labels)?;
                        event.push_datum(datum);
                    }
                    (ColumnRef::None, DecodedValue::PackedRow(payloads)) => {
                        let value_columns = ctx.schema.columns.iter().filter(|c| !c.is_key);
                        for (column, payload) in value_columns.zip(payloads.iter()) {
                            let datum =
                                datum_for_column(column, payload.as_deref(), ctx.enum_labels)?;
                            event.push_datum(datum);
                        }
                    }
                    (ColumnRef::System(_), _) => {}
                    _ => {}
                }
            }
        }
    }

    if let Some(row) = pending.take() {
        out.push(ChangeRecord {
            op_id: EventOpId::at(ctx.op_id),
            row,
        });
    }
    Ok(())
}
