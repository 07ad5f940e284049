//! Streams one applied transaction's provisional intents as logical events.
//!
//! A fresh transaction opens with `BEGIN` and closes with `COMMIT`; when the
//! per-batch budget runs out mid-transaction the `COMMIT` is withheld and
//! the returned resume state points at the last emitted intent, so the next
//! request picks up the same transaction without re-emitting anything.

use tide_row::{HybridTime, OpId, TransactionId};
use tracing::error;

use crate::consumption::ScopedConsumption;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, EnumLabelMap, EventKind, EventOpId, RowEvent};
use crate::rows::{RowAssembler, RowContext};
use crate::schema_cache::SchemaResolver;
use crate::tablet::{CatalogClient, IntentResume, IntentStore, TabletHandle};

/// Result of one intent-streaming pass.
pub struct IntentOutcome {
    /// Empty-key/zero-write-id when the transaction finished cleanly;
    /// otherwise the position to resume from.
    pub resume: IntentResume,
}

impl IntentOutcome {
    pub fn is_complete(&self) -> bool {
        self.resume.is_start()
    }
}

/// Streams intents of `txn` starting at `resume`.
#[allow(clippy::too_many_arguments)]
pub async fn stream_intents(
    tablet: &dyn TabletHandle,
    intent_store: &dyn IntentStore,
    catalog: &dyn CatalogClient,
    resolver: &SchemaResolver,
    enum_labels: &EnumLabelMap,
    packed_updates: bool,
    op_id: OpId,
    txn: TransactionId,
    commit_time: Option<HybridTime>,
    resume: IntentResume,
    consumption: &mut ScopedConsumption,
    out: &mut Vec<ChangeRecord>,
) -> Result<IntentOutcome> {
    let table_name = tablet.table_name();
    let fresh_transaction = resume.is_start();

    if fresh_transaction {
        let mut begin = RowEvent::new(EventKind::Begin, &table_name, "");
        begin.transaction_id = Some(txn);
        out.push(ChangeRecord {
            op_id: EventOpId::at(op_id),
            row: begin,
        });
    }

    let (intents, next_resume) = intent_store
        .intents_for(txn, &resume)
        .map_err(CdcError::Internal)?;

    // An apply record at or below the retention checkpoint with no intents
    // left means GC already removed them: the stream cannot recover.
    let retention_checkpoint = tablet.retention_checkpoint();
    if intents.is_empty() && op_id <= retention_checkpoint {
        error!(
            tablet_id = tablet.tablet_id(),
            %txn,
            %op_id,
            %retention_checkpoint,
            "apply record is below the retention checkpoint and its intents are gone"
        );
        return Err(CdcError::IntentsGced {
            txn,
            op_id,
            retention_checkpoint,
        });
    }

    // Pin the schema for decoding at the first intent's time.
    let read_time = intents
        .first()
        .map(|i| i.intent_time)
        .or(commit_time)
        .unwrap_or(HybridTime::MAX);
    let (schema, _version) = resolver.resolve_at(tablet, catalog, read_time).await;

    let ctx = RowContext {
        schema: &*schema,
        table_name: &table_name,
        enum_labels,
        op_id,
        transaction_id: Some(txn),
        commit_time,
    };
    let mut assembler = RowAssembler::new(ctx, packed_updates);
    let mut cursor = IntentResume::default();
    for intent in &intents {
        consumption.add(intent.key.len() as u64);
        assembler.push_intent(intent, out, &mut cursor)?;
    }
    assembler.finish(out, &mut cursor)?;

    match next_resume {
        Some(store_resume) => {
            // More intents remain: no COMMIT, resume from the last emitted
            // locator. If the batch produced no locator at all, fall back to
            // the store's own position so the cursor stays in-transaction.
            let resume = if cursor.is_start() { store_resume } else { cursor };
            Ok(IntentOutcome { resume })
        }
        None => {
            let mut commit = RowEvent::new(EventKind::Commit, &table_name, "");
            commit.transaction_id = Some(txn);
            out.push(ChangeRecord {
                op_id: EventOpId::at(op_id),
                row: commit,
            });
            Ok(IntentOutcome {
                resume: IntentResume::default(),
            })
        }
    }
}
