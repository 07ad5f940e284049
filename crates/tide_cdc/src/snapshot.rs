//! Consistent-read snapshot backfill.
//!
//! The first snapshot call is a handshake: it pins the read time at the
//! tablet's last replicated entry, extends the intent-GC horizon so
//! streaming can pick up where the snapshot ends, and returns a cursor with
//! no events. Continuations scan batches of rows at the pinned time; once
//! the scan key runs out the cursor drops back to streaming mode and the
//! retention pin is released.

use std::time::Instant;

use tide_row::HybridTime;
use tracing::info;

use crate::checkpoint::Checkpoint;
use crate::config::ProducerOptions;
use crate::consumption::ScopedConsumption;
use crate::datum::datum_for_value;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, EnumLabelMap, EventKind, EventOpId, RowEvent};
use crate::schema_cache::SchemaResolver;
use crate::tablet::{CatalogClient, TabletHandle};
use crate::wal::fill_colocated_ddl;

/// Result of one snapshot pass.
pub struct SnapshotOutcome {
    pub checkpoint: Checkpoint,
}

/// Handles a snapshot-mode request (handshake or continuation).
#[allow(clippy::too_many_arguments)]
pub async fn stream_snapshot(
    tablet: &dyn TabletHandle,
    catalog: &dyn CatalogClient,
    resolver: &SchemaResolver,
    enum_labels: &EnumLabelMap,
    options: &ProducerOptions,
    from: &Checkpoint,
    deadline: Instant,
    consumption: &mut ScopedConsumption,
    out: &mut Vec<ChangeRecord>,
) -> Result<SnapshotOutcome> {
    if from.is_snapshot_handshake() {
        return begin_snapshot(tablet, options).await;
    }
    continue_snapshot(
        tablet,
        catalog,
        resolver,
        enum_labels,
        options,
        from,
        deadline,
        consumption,
        out,
    )
    .await
}

/// Pins the snapshot read time and hands the cursor back with no events.
async fn begin_snapshot(
    tablet: &dyn TabletHandle,
    options: &ProducerOptions,
) -> Result<SnapshotOutcome> {
    let (op_id, log_time) = tablet.last_replicated().map_err(CdcError::Internal)?;

    tablet.update_consumer_op_id(op_id);
    tablet.pin_intent_retention(op_id, options.intent_retention);
    info!(
        tablet_id = tablet.tablet_id(),
        %op_id,
        snapshot_time = log_time.as_u64(),
        "snapshot initialized, intent retention pinned"
    );

    Ok(SnapshotOutcome {
        checkpoint: Checkpoint::snapshot(op_id, Vec::new(), log_time),
    })
}

#[allow(clippy::too_many_arguments)]
async fn continue_snapshot(
    tablet: &dyn TabletHandle,
    catalog: &dyn CatalogClient,
    resolver: &SchemaResolver,
    enum_labels: &EnumLabelMap,
    options: &ProducerOptions,
    from: &Checkpoint,
    deadline: Instant,
    consumption: &mut ScopedConsumption,
    out: &mut Vec<ChangeRecord>,
) -> Result<SnapshotOutcome> {
    if options.test_snapshot_failure {
        return Err(CdcError::SnapshotFailed {
            tablet_id: tablet.tablet_id(),
            reason: "injected failure".to_string(),
        });
    }

    let read_time = from.snapshot_time();

    // Schema for the whole snapshot: the newest the catalog can serve. On
    // the first continuation of a session the colocated DDL records go out
    // ahead of any READ event.
    let cache_was_cold = resolver.cached().is_none();
    let (schema, version) = resolver.resolve_at(tablet, catalog, HybridTime::MAX).await;
    if cache_was_cold {
        fill_colocated_ddl(tablet, &schema, version, from.op_id(), out);
    }

    let mut iter = tablet
        .snapshot_iterator(read_time, &from.key)
        .map_err(|err| CdcError::SnapshotFailed {
            tablet_id: tablet.tablet_id(),
            reason: format!("{err:#}"),
        })?;

    let table_name = tablet.table_name();
    let mut fetched = 0usize;
    while fetched < options.snapshot_batch_size {
        if Instant::now() >= deadline {
            break;
        }
        let Some(row) = iter.next_row().map_err(|err| CdcError::SnapshotFailed {
            tablet_id: tablet.tablet_id(),
            reason: format!("{err:#}"),
        })?
        else {
            break;
        };

        let mut event = RowEvent::new(EventKind::Read, &table_name, &schema.schema_name);
        event.commit_time = Some(read_time);
        for (idx, value) in row.iter().enumerate() {
            let column = schema.column(idx).map_err(CdcError::Internal)?;
            let datum = datum_for_value(column, value.as_ref(), enum_labels)?;
            event.push_datum(datum);
        }
        consumption.add(event.approx_size());
        out.push(ChangeRecord {
            op_id: EventOpId::at(from.op_id()),
            row: event,
        });
        fetched += 1;
    }

    let next_key = iter
        .next_scan_key()
        .map_err(|err| CdcError::SnapshotFailed {
            tablet_id: tablet.tablet_id(),
            reason: format!("{err:#}"),
        })?;

    if next_key.is_empty() {
        info!(
            tablet_id = tablet.tablet_id(),
            rows = fetched,
            "snapshot complete, leaving snapshot mode"
        );
        tablet.release_intent_retention();
        Ok(SnapshotOutcome {
            checkpoint: Checkpoint::at_boundary(from.op_id()),
        })
    } else {
        Ok(SnapshotOutcome {
            checkpoint: Checkpoint::snapshot(from.op_id(), next_key, read_time),
        })
    }
}
