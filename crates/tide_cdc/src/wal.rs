//! Walks newly replicated log entries and dispatches by entry kind.
//!
//! The streamer reads strictly after the incoming checkpoint up to the
//! caller-supplied readable bound or the deadline. A batch with no
//! actionable entry triggers another fetch; if nothing actionable is found
//! at all, the cursor still advances to the last skipped entry so the
//! consumer makes progress.

use std::time::Instant;

use tide_row::schema::TableSchema;
use tide_row::{OpId, SchemaVersion};
use tracing::{info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::ProducerOptions;
use crate::consumption::ScopedConsumption;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, ColumnInfo, DdlSchemaInfo, EnumLabelMap, EventKind, EventOpId, RowEvent};
use crate::intents::stream_intents;
use crate::rows::{assemble_write_batch, RowContext};
use crate::schema_cache::SchemaResolver;
use crate::tablet::{CatalogClient, IntentResume, IntentStore, LogEntry, LogReader, TabletHandle};

/// A tablet split is only real once the catalog shows this many children.
const SPLIT_CHILD_COUNT: usize = 2;

/// Result of one WAL streaming pass.
pub struct WalOutcome {
    /// `None` when nothing at all could be advanced past.
    pub checkpoint: Option<Checkpoint>,
    /// Set when a verified split entry became the checkpoint; the
    /// coordinator turns this into the terminal signal.
    pub split_op_id: Option<OpId>,
    /// Last log position fully streamed.
    pub last_streamed_op_id: Option<OpId>,
}

/// Builds the wire row event for a DDL.
pub(crate) fn ddl_row_event(
    table_name: &str,
    schema: &TableSchema,
    version: SchemaVersion,
    new_table_name: Option<String>,
) -> RowEvent {
    let mut event = RowEvent::new(EventKind::Ddl, table_name, &schema.schema_name);
    event.schema = Some(DdlSchemaInfo {
        columns: schema.columns.iter().map(ColumnInfo::from_schema).collect(),
        properties: schema.properties,
    });
    event.schema_version = Some(version);
    event.new_table_name = new_table_name;
    event
}

/// Emits one synthetic DDL per colocated table so consumers learn the
/// schema in force before the first row event of a session.
pub(crate) fn fill_colocated_ddl(
    tablet: &dyn TabletHandle,
    schema: &TableSchema,
    version: SchemaVersion,
    op_id: OpId,
    out: &mut Vec<ChangeRecord>,
) {
    for (_table_id, table_name) in tablet.colocated_tables() {
        out.push(ChangeRecord {
            op_id: EventOpId::at(op_id),
            row: ddl_row_event(&table_name, schema, version, None),
        });
    }
}

/// Streams log entries after `from` until progress is made, the readable
/// bound is reached, or the deadline expires.
#[allow(clippy::too_many_arguments)]
pub async fn stream_wal(
    tablet: &dyn TabletHandle,
    log: &dyn LogReader,
    intent_store: &dyn IntentStore,
    catalog: &dyn CatalogClient,
    resolver: &SchemaResolver,
    enum_labels: &EnumLabelMap,
    options: &ProducerOptions,
    from: &Checkpoint,
    last_readable_op_index: Option<i64>,
    deadline: Instant,
    consumption: &mut ScopedConsumption,
    out: &mut Vec<ChangeRecord>,
) -> Result<WalOutcome> {
    let mut last_seen = from.op_id();
    // Last entry we skipped without acting on; used to advance the cursor
    // when a whole pass yields nothing actionable.
    let mut last_non_actionable: Option<OpId> = None;
    let mut checkpoint: Option<Checkpoint> = None;
    let mut last_streamed: Option<OpId> = None;
    let mut split_op_id: Option<OpId> = None;
    let mut schema_streamed = false;

    'outer: loop {
        if Instant::now() >= deadline {
            break;
        }
        let batch = log
            .read_after(last_seen, last_readable_op_index, deadline)
            .await
            .map_err(CdcError::Internal)?;
        consumption.add(batch.read_from_disk_bytes);
        if batch.entries.is_empty() {
            break;
        }

        for entry in &batch.entries {
            let op_id = entry.op_id();
            last_seen = op_id;

            if !schema_streamed && resolver.cached().is_none() {
                let (schema, version) =
                    resolver.resolve_at(tablet, catalog, entry.hybrid_time()).await;
                fill_colocated_ddl(tablet, &schema, version, op_id, out);
                schema_streamed = true;
            }

            match entry.as_ref() {
                LogEntry::Write {
                    transactional: true,
                    ..
                } => {
                    // Row data arrives later via the transaction's apply
                    // record, which always has a higher index.
                    last_non_actionable = Some(op_id);
                }
                LogEntry::Write {
                    batch: write_batch,
                    hybrid_time,
                    ..
                } => {
                    let (schema, _version) =
                        resolver.resolve_at(tablet, catalog, entry.hybrid_time()).await;
                    let table_name = tablet.table_name();
                    let ctx = RowContext {
                        schema: &*schema,
                        table_name: &table_name,
                        enum_labels,
                        op_id,
                        transaction_id: None,
                        commit_time: Some(*hybrid_time),
                    };
                    assemble_write_batch(&ctx, write_batch, out)?;
                    checkpoint = Some(Checkpoint::at_boundary(op_id));
                    last_streamed = Some(op_id);
                }
                LogEntry::TransactionApply {
                    txn_id,
                    commit_time,
                    ..
                } => {
                    let outcome = stream_intents(
                        tablet,
                        intent_store,
                        catalog,
                        resolver,
                        enum_labels,
                        options.single_record_update,
                        op_id,
                        *txn_id,
                        Some(*commit_time),
                        IntentResume::default(),
                        consumption,
                        out,
                    )
                    .await?;
                    if outcome.is_complete() {
                        checkpoint = Some(Checkpoint::at_boundary(op_id));
                        last_streamed = Some(op_id);
                    } else {
                        // The per-batch budget cut the transaction short:
                        // stop here so the next request resumes it before
                        // anything after this entry is observed.
                        info!(
                            tablet_id = tablet.tablet_id(),
                            txn = %txn_id,
                            %op_id,
                            "pending intents remain for transaction"
                        );
                        checkpoint = Some(Checkpoint::mid_transaction(
                            op_id,
                            outcome.resume.key,
                            outcome.resume.write_id,
                        ));
                        break 'outer;
                    }
                }
                LogEntry::ChangeMetadata {
                    schema: entry_schema,
                    schema_version: entry_version,
                    new_table_name,
                    hybrid_time,
                    ..
                } => {
                    // The entry may belong to a rejected DDL attempt;
                    // cross-check the catalog at the entry's time and let
                    // the catalog win.
                    resolver.install(entry_schema.clone(), *entry_version);
                    let mut resolved_schema = entry_schema.clone();
                    let mut resolved_version = *entry_version;
                    match catalog
                        .table_schema_at(tablet.table_id(), *hybrid_time)
                        .await
                    {
                        Ok(Some((schema, version))) => {
                            if version != resolved_version {
                                resolver.install(schema.clone(), version);
                                resolved_schema = schema;
                                resolved_version = version;
                            }
                        }
                        Ok(None) => {
                            warn!(
                                table = %tablet.table_name(),
                                entry_version = *entry_version,
                                "catalog has no schema at change-metadata time, keeping the entry's version"
                            );
                        }
                        Err(err) => {
                            warn!(
                                table = %tablet.table_name(),
                                entry_version = *entry_version,
                                error = %format!("{err:#}"),
                                "catalog lookup failed for change-metadata entry, keeping the entry's version"
                            );
                        }
                    }

                    let duplicate = out.last().is_some_and(|record| {
                        record.row.kind == EventKind::Ddl
                            && record.row.schema_version == Some(resolved_version)
                    });
                    if !duplicate {
                        out.push(ChangeRecord {
                            op_id: EventOpId::at(op_id),
                            row: ddl_row_event(
                                &tablet.table_name(),
                                &resolved_schema,
                                resolved_version,
                                new_table_name.clone(),
                            ),
                        });
                    }
                    checkpoint = Some(Checkpoint::at_boundary(op_id));
                    last_streamed = Some(op_id);
                }
                LogEntry::Truncate { .. } => {
                    if options.stream_truncate_record {
                        let (schema, _version) =
                            resolver.resolve_at(tablet, catalog, entry.hybrid_time()).await;
                        out.push(ChangeRecord {
                            op_id: EventOpId::at(op_id),
                            row: RowEvent::new(
                                EventKind::Truncate,
                                &tablet.table_name(),
                                &schema.schema_name,
                            ),
                        });
                        checkpoint = Some(Checkpoint::at_boundary(op_id));
                        last_streamed = Some(op_id);
                    } else {
                        last_non_actionable = Some(op_id);
                    }
                }
                LogEntry::Split { .. } => {
                    let verified = match catalog
                        .split_children_of(tablet.table_id(), tablet.tablet_id())
                        .await
                    {
                        Ok(children) => children == SPLIT_CHILD_COUNT,
                        Err(err) => {
                            warn!(
                                tablet_id = tablet.tablet_id(),
                                error = %format!("{err:#}"),
                                "could not verify tablet split against the catalog"
                            );
                            false
                        }
                    };
                    if !verified {
                        // Possible when the children are not up yet, or when
                        // the split entry belongs to a failed attempt.
                        info!(
                            tablet_id = tablet.tablet_id(),
                            %op_id,
                            "split entry without two children in the catalog, skipping"
                        );
                        last_non_actionable = Some(op_id);
                    } else if checkpoint.is_some() || !out.is_empty() {
                        // Stream what we have; the next call will re-observe
                        // the split entry and terminate.
                        info!(
                            tablet_id = tablet.tablet_id(),
                            %op_id,
                            "verified split entry, streaming buffered records first"
                        );
                        break 'outer;
                    } else {
                        info!(
                            tablet_id = tablet.tablet_id(),
                            %op_id,
                            "verified split entry with nothing left to stream, reporting split"
                        );
                        checkpoint = Some(Checkpoint::at_boundary(op_id));
                        last_streamed = Some(op_id);
                        split_op_id = Some(op_id);
                        break 'outer;
                    }
                }
                LogEntry::Other { .. } => {
                    last_non_actionable = Some(op_id);
                }
            }
        }

        if checkpoint.is_some() {
            break;
        }
        match last_readable_op_index {
            Some(bound) if last_seen.index < bound => continue,
            _ => break,
        }
    }

    if checkpoint.is_none() {
        if let Some(op_id) = last_non_actionable {
            checkpoint = Some(Checkpoint::at_boundary(op_id));
            last_streamed = Some(op_id);
        }
    }

    Ok(WalOutcome {
        checkpoint,
        split_op_id,
        last_streamed_op_id: last_streamed,
    })
}
