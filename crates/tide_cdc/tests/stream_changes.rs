//! Streaming-mode scenarios: transactions, write batches, DDL handling.

mod common;

use std::time::{Duration, Instant};

use common::{
    apply_entry, column_intent, other_entry, widened_schema, write_entry, write_pair, Harness,
    STREAM_ID, TABLET_ID,
};
use tide_cdc::events::{EventKind, GetChangesRequest};
use tide_cdc::{Checkpoint, ProducerOptions, StreamMode};
use tide_row::{HybridTime, OpId, SchemaVersion, TransactionId};

fn kinds(response: &tide_cdc::GetChangesResponse) -> Vec<EventKind> {
    response.records.iter().map(|r| r.row.kind).collect()
}

#[tokio::test]
async fn packed_update_streams_one_event_per_row() {
    // One transaction writes c1=10 and c2=20 on row 7.
    let harness = Harness::new();
    let txn = TransactionId::new(1, 1);
    let commit_time = HybridTime::from_micros(2_000);
    let apply_op = OpId::new(1, 2);
    harness.log.push(apply_entry(apply_op, txn, commit_time));
    harness.intents.insert(
        txn,
        vec![
            column_intent(txn, 1, 7, 2, 10, commit_time),
            column_intent(txn, 2, 7, 3, 20, commit_time),
        ],
    );

    let response = harness
        .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
        .await
        .unwrap();

    // The session's first response carries the colocated DDL up front.
    assert_eq!(
        kinds(&response),
        vec![EventKind::Ddl, EventKind::Begin, EventKind::Update, EventKind::Commit]
    );
    let update = &response.records[2];
    assert_eq!(update.row.transaction_id, Some(txn));
    assert_eq!(update.row.commit_time, Some(commit_time));
    // pk + both written columns, folded into one event.
    assert_eq!(update.row.new_tuple.iter().flatten().count(), 3);
    // Locator of the last folded intent.
    assert_eq!(update.op_id.write_id, 2);

    assert_eq!(response.checkpoint, Checkpoint::at_boundary(apply_op));
    assert_eq!(response.streamed_op_id, Some(apply_op));
}

#[tokio::test]
async fn mid_transaction_resume_continues_without_reemitting() {
    // The per-call intent budget cuts the transaction after c1.
    let harness = Harness::new();
    let txn = TransactionId::new(1, 1);
    let commit_time = HybridTime::from_micros(2_000);
    let apply_op = OpId::new(1, 2);
    harness.log.push(apply_entry(apply_op, txn, commit_time));
    harness.intents.insert(
        txn,
        vec![
            column_intent(txn, 1, 7, 2, 10, commit_time),
            column_intent(txn, 2, 7, 3, 20, commit_time),
        ],
    );
    *harness.intents.batch_limit.lock().unwrap() = 1;

    let first = harness
        .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(
        kinds(&first),
        vec![EventKind::Ddl, EventKind::Begin, EventKind::Update]
    );
    assert_eq!(first.checkpoint.mode(), StreamMode::TransactionResume);
    assert_eq!(first.checkpoint.op_id(), apply_op);
    assert_eq!(first.checkpoint.write_id, 1);
    assert!(!first.checkpoint.key.is_empty());
    // No COMMIT yet.
    assert!(first.records.iter().all(|r| r.row.kind != EventKind::Commit));

    let second = harness.get_changes(first.checkpoint.clone()).await.unwrap();
    assert_eq!(kinds(&second), vec![EventKind::Update, EventKind::Commit]);
    // The resumed event covers only the remaining column (plus the pk).
    let update = &second.records[0];
    assert_eq!(update.row.new_tuple.iter().flatten().count(), 2);
    assert_eq!(update.row.transaction_id, Some(txn));
    assert_eq!(second.checkpoint, Checkpoint::at_boundary(apply_op));
}

#[tokio::test]
async fn unpacked_mode_emits_per_column_events() {
    let mut options = ProducerOptions::default();
    options.single_record_update = false;
    let harness = Harness::with_options(options);
    let txn = TransactionId::new(1, 1);
    let commit_time = HybridTime::from_micros(2_000);
    harness.log.push(apply_entry(OpId::new(1, 2), txn, commit_time));
    harness.intents.insert(
        txn,
        vec![
            column_intent(txn, 1, 7, 2, 10, commit_time),
            column_intent(txn, 2, 7, 3, 20, commit_time),
        ],
    );

    let response = harness
        .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(
        kinds(&response),
        vec![
            EventKind::Ddl,
            EventKind::Begin,
            EventKind::Update,
            EventKind::Update,
            EventKind::Commit
        ]
    );
}

#[tokio::test]
async fn redundant_change_metadata_entries_produce_one_ddl() {
    // Two successive change-metadata entries at the same resulting
    // schema version.
    let harness = Harness::new();
    let from = harness.warm_schema().await;

    let ddl_time = HybridTime::from_micros(3_000);
    let new_schema = widened_schema();
    let new_version: SchemaVersion = 2;
    harness
        .catalog
        .add_version(ddl_time, new_schema.clone(), new_version);
    for index in [2, 3] {
        harness.log.push(tide_cdc::tablet::LogEntry::ChangeMetadata {
            op_id: OpId::new(1, index),
            hybrid_time: ddl_time,
            schema: new_schema.clone(),
            schema_version: new_version,
            new_table_name: None,
        });
    }

    let response = harness.get_changes(from).await.unwrap();
    assert_eq!(kinds(&response), vec![EventKind::Ddl]);
    assert_eq!(response.records[0].row.schema_version, Some(new_version));
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(OpId::new(1, 3)));
}

#[tokio::test]
async fn catalog_wins_over_change_metadata_version() {
    // The log entry claims version 2 but the catalog resolved the time to
    // version 3: the catalog value is emitted.
    let harness = Harness::new();
    let from = harness.warm_schema().await;

    let ddl_time = HybridTime::from_micros(3_000);
    let new_schema = widened_schema();
    harness.catalog.add_version(ddl_time, new_schema.clone(), 3);
    harness.log.push(tide_cdc::tablet::LogEntry::ChangeMetadata {
        op_id: OpId::new(1, 2),
        hybrid_time: ddl_time,
        schema: new_schema,
        schema_version: 2,
        new_table_name: None,
    });

    let response = harness.get_changes(from).await.unwrap();
    assert_eq!(kinds(&response), vec![EventKind::Ddl]);
    assert_eq!(response.records[0].row.schema_version, Some(3));
}

#[tokio::test]
async fn non_transactional_write_batch_has_no_bracket() {
    let harness = Harness::new();
    let from = harness.warm_schema().await;

    let write_time = HybridTime::from_micros(4_000);
    let write_op = OpId::new(1, 2);
    harness.log.push(write_entry(
        write_op,
        write_time,
        vec![write_pair(1, 2, 10), write_pair(1, 3, 20), write_pair(2, 2, 30)],
    ));

    let response = harness.get_changes(from).await.unwrap();
    assert_eq!(kinds(&response), vec![EventKind::Update, EventKind::Update]);
    assert!(response.records.iter().all(|r| r.row.transaction_id.is_none()));
    assert!(response
        .records
        .iter()
        .all(|r| r.row.commit_time == Some(write_time)));
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(write_op));
    assert_eq!(response.streamed_op_id, Some(write_op));
}

#[tokio::test]
async fn transactional_write_entries_are_skipped_but_advance() {
    let harness = Harness::new();
    let from = harness.warm_schema().await;

    let op = OpId::new(1, 2);
    harness.log.push(tide_cdc::tablet::LogEntry::Write {
        op_id: op,
        hybrid_time: HybridTime::from_micros(4_000),
        batch: tide_cdc::tablet::WriteBatch {
            pairs: vec![write_pair(1, 2, 10)],
        },
        transactional: true,
    });

    let response = harness.get_changes(from).await.unwrap();
    assert!(response.records.is_empty());
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(op));
}

#[tokio::test]
async fn truncate_entries_follow_the_option() {
    // Disabled by default: the entry is skipped and the cursor advances.
    let harness = Harness::new();
    let from = harness.warm_schema().await;
    let op = OpId::new(1, 2);
    harness.log.push(tide_cdc::tablet::LogEntry::Truncate {
        op_id: op,
        hybrid_time: HybridTime::from_micros(4_000),
    });
    let response = harness.get_changes(from).await.unwrap();
    assert!(response.records.is_empty());
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(op));

    // Enabled: the entry becomes an event.
    let mut options = ProducerOptions::default();
    options.stream_truncate_record = true;
    let harness = Harness::with_options(options);
    let from = harness.warm_schema().await;
    let op = OpId::new(1, 2);
    harness.log.push(tide_cdc::tablet::LogEntry::Truncate {
        op_id: op,
        hybrid_time: HybridTime::from_micros(4_000),
    });
    let response = harness.get_changes(from).await.unwrap();
    assert_eq!(kinds(&response), vec![EventKind::Truncate]);
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(op));
}

#[tokio::test]
async fn empty_log_echoes_the_received_checkpoint() {
    let harness = Harness::new();
    let from = Checkpoint::at_boundary(OpId::new(0, 0));
    let response = harness.get_changes(from.clone()).await.unwrap();
    assert!(response.records.is_empty());
    assert_eq!(response.checkpoint, from);
    assert_eq!(response.streamed_op_id, None);
}

#[tokio::test]
async fn all_skip_batches_are_refetched_until_actionable() {
    let harness = Harness::new();
    *harness.log.batch_limit.lock().unwrap() = 1;
    harness
        .log
        .push(other_entry(OpId::new(1, 1), HybridTime::from_micros(100)));
    harness
        .log
        .push(other_entry(OpId::new(1, 2), HybridTime::from_micros(200)));
    harness.log.push(write_entry(
        OpId::new(1, 3),
        HybridTime::from_micros(300),
        vec![write_pair(1, 2, 10)],
    ));

    let response = harness
        .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(kinds(&response), vec![EventKind::Ddl, EventKind::Update]);
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(OpId::new(1, 3)));
}

#[tokio::test]
async fn expired_deadline_returns_what_was_assembled() {
    let harness = Harness::new();
    harness
        .log
        .push(write_entry(OpId::new(1, 1), HybridTime::from_micros(100), vec![write_pair(1, 2, 1)]));

    let request = GetChangesRequest {
        stream_id: STREAM_ID.to_string(),
        tablet_id: TABLET_ID,
        checkpoint: Checkpoint::at_boundary(OpId::new(0, 0)),
        last_readable_op_index: harness.log.max_index(),
    };
    let expired = Instant::now() - Duration::from_millis(1);
    let response = harness
        .producer
        .get_changes(&request, &harness.enum_labels, expired)
        .await
        .unwrap();
    // No fetch happened; the received checkpoint is echoed.
    assert!(response.records.is_empty());
    assert_eq!(response.checkpoint, Checkpoint::at_boundary(OpId::new(0, 0)));
}

#[tokio::test]
async fn catalog_outage_falls_back_to_tablet_schema() {
    let harness = Harness::new();
    harness
        .catalog
        .fail_lookups
        .store(true, std::sync::atomic::Ordering::Relaxed);

    let txn = TransactionId::new(1, 1);
    let commit_time = HybridTime::from_micros(2_000);
    harness.log.push(apply_entry(OpId::new(1, 2), txn, commit_time));
    harness.intents.insert(
        txn,
        vec![column_intent(txn, 1, 7, 2, 10, commit_time)],
    );

    // The soft fallback keeps the request alive on the tablet's current
    // schema instead of failing.
    let response = harness
        .get_changes(Checkpoint::at_boundary(OpId::new(0, 0)))
        .await
        .unwrap();
    assert_eq!(
        kinds(&response),
        vec![EventKind::Ddl, EventKind::Begin, EventKind::Update, EventKind::Commit]
    );
    // The colocated DDL carries the tablet's own version.
    assert_eq!(response.records[0].row.schema_version, Some(1));
}
