//! Top-level per-request state machine.
//!
//! One producer instance serves one tablet for the lifetime of a session;
//! concurrent requests for different consumers share its schema cache and
//! memory tracker. Each request inspects the incoming checkpoint, picks a
//! mode, drives one streamer to the deadline, and echoes either the
//! advanced checkpoint or the received one when no progress was possible.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tide_row::keys::decode_reverse_index_key;
use tide_row::OpId;
use tracing::{debug, error};

use crate::checkpoint::{Checkpoint, StreamMode};
use crate::config::OptionsProvider;
use crate::consumption::{MemTracker, ScopedConsumption};
use crate::error::{CdcError, Result, TerminalStatus};
use crate::events::{EnumLabelMap, GetChangesRequest, GetChangesResponse};
use crate::intents::stream_intents;
use crate::schema_cache::SchemaResolver;
use crate::snapshot::stream_snapshot;
use crate::tablet::{CatalogClient, IntentResume, IntentStore, LogReader, TabletHandle};
use crate::wal::stream_wal;

pub struct CdcProducer {
    tablet: Arc<dyn TabletHandle>,
    log: Arc<dyn LogReader>,
    intent_store: Arc<dyn IntentStore>,
    catalog: Arc<dyn CatalogClient>,
    resolver: SchemaResolver,
    mem_tracker: Arc<MemTracker>,
    options: OptionsProvider,
}

impl CdcProducer {
    pub fn new(
        tablet: Arc<dyn TabletHandle>,
        log: Arc<dyn LogReader>,
        intent_store: Arc<dyn IntentStore>,
        catalog: Arc<dyn CatalogClient>,
        options: OptionsProvider,
    ) -> Self {
        CdcProducer {
            tablet,
            log,
            intent_store,
            catalog,
            resolver: SchemaResolver::new(),
            mem_tracker: MemTracker::new(),
            options,
        }
    }

    pub fn mem_tracker(&self) -> Arc<MemTracker> {
        self.mem_tracker.clone()
    }

    /// Serves one `GetChanges` request.
    pub async fn get_changes(
        &self,
        request: &GetChangesRequest,
        enum_labels: &EnumLabelMap,
        deadline: Instant,
    ) -> Result<GetChangesResponse> {
        if request.tablet_id != self.tablet.tablet_id() {
            return Err(CdcError::Internal(anyhow!(
                "request for tablet {} routed to producer of tablet {}",
                request.tablet_id,
                self.tablet.tablet_id()
            )));
        }

        // One option snapshot per request; a mid-request flip of an
        // environment variable must not change modes inside a response.
        let options = self.options.current();
        let mut consumption = ScopedConsumption::new(self.mem_tracker.clone());
        let mut records = Vec::new();
        let from = &request.checkpoint;
        debug!(
            stream_id = %request.stream_id,
            tablet_id = request.tablet_id,
            checkpoint = %from,
            "serving get_changes"
        );

        let mut checkpoint: Option<Checkpoint> = None;
        let mut streamed_op_id: Option<OpId> = None;
        let mut terminal_status = TerminalStatus::Ok;

        match from.mode() {
            StreamMode::Snapshot => {
                let outcome = stream_snapshot(
                    self.tablet.as_ref(),
                    self.catalog.as_ref(),
                    &self.resolver,
                    enum_labels,
                    &options,
                    from,
                    deadline,
                    &mut consumption,
                    &mut records,
                )
                .await?;
                checkpoint = Some(outcome.checkpoint);
            }
            StreamMode::TransactionResume => {
                let (txn, _seq) =
                    decode_reverse_index_key(&from.key).map_err(CdcError::corrupt)?;
                if from.write_id < 0 {
                    return Err(CdcError::corrupt(anyhow!(
                        "mid-transaction checkpoint with negative write id {}",
                        from.write_id
                    )));
                }
                let resume = IntentResume {
                    key: from.key.clone(),
                    write_id: from.write_id as u32,
                };
                let outcome = stream_intents(
                    self.tablet.as_ref(),
                    self.intent_store.as_ref(),
                    self.catalog.as_ref(),
                    &self.resolver,
                    enum_labels,
                    options.single_record_update,
                    from.op_id(),
                    txn,
                    None,
                    resume,
                    &mut consumption,
                    &mut records,
                )
                .await?;
                if outcome.is_complete() {
                    checkpoint = Some(Checkpoint::at_boundary(from.op_id()));
                    streamed_op_id = Some(from.op_id());
                } else {
                    checkpoint = Some(Checkpoint::mid_transaction(
                        from.op_id(),
                        outcome.resume.key,
                        outcome.resume.write_id,
                    ));
                }
            }
            StreamMode::WalStreaming => {
                let outcome = stream_wal(
                    self.tablet.as_ref(),
                    self.log.as_ref(),
                    self.intent_store.as_ref(),
                    self.catalog.as_ref(),
                    &self.resolver,
                    enum_labels,
                    &options,
                    from,
                    request.last_readable_op_index,
                    deadline,
                    &mut consumption,
                    &mut records,
                )
                .await?;
                streamed_op_id = outcome.last_streamed_op_id;
                if let (Some(split_op), Some(new_checkpoint)) =
                    (outcome.split_op_id, outcome.checkpoint.as_ref())
                {
                    // The split became the checkpoint with nothing else to
                    // stream: tell the consumer to move to the children.
                    if split_op == new_checkpoint.op_id() {
                        terminal_status = TerminalStatus::TabletSplit;
                    }
                }
                checkpoint = outcome.checkpoint;
            }
        }

        let new_checkpoint = checkpoint.unwrap_or_else(|| from.clone());
        if new_checkpoint.stream_order(from) == Ordering::Less {
            // Never expected; losing cursor ground would re-emit events.
            error!(
                stream_id = %request.stream_id,
                tablet_id = request.tablet_id,
                received = %from,
                returned = %new_checkpoint,
                "returned checkpoint ranks below the received one"
            );
            return Err(CdcError::Internal(anyhow!(
                "checkpoint regression: received {from}, returned {new_checkpoint}"
            )));
        }

        let response_bytes: u64 = records.iter().map(|r| r.row.approx_size()).sum();
        consumption.add(response_bytes);

        Ok(GetChangesResponse {
            records,
            checkpoint: new_checkpoint,
            streamed_op_id: streamed_op_id.filter(|op| op.index > 0),
            terminal_status,
        })
    }
}
