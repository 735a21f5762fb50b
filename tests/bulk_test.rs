// ABOUTME: Integration tests for bounded and full-table bulk sync
// ABOUTME: Checks batch boundaries, contained batch failures, and backfill pagination

mod common;

use common::{registry, FakeMirror, FakeSource};
use mirror_sync::bulk::{BulkSyncer, DEFAULT_BATCH_SIZE};
use mirror_sync::stats::StatsTracker;
use serde_json::json;
use std::sync::Arc;

fn syncer(
    source: &Arc<FakeSource>,
    mirror: &Arc<FakeMirror>,
    batch_size: usize,
) -> (BulkSyncer, Arc<StatsTracker>) {
    let stats = Arc::new(StatsTracker::new());
    let syncer = BulkSyncer::new(
        registry(),
        source.clone(),
        mirror.clone(),
        stats.clone(),
        batch_size,
    );
    (syncer, stats)
}

#[tokio::test]
async fn test_sync_table_splits_into_batches() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(120);
    let (syncer, stats) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let summary = syncer.sync_table("conversations", 120).await.unwrap();

    assert_eq!(mirror.upsert_calls(), vec![50, 50, 20]);
    assert_eq!(summary.rows_read, 120);
    assert_eq!(summary.rows_written, 120);
    assert_eq!(summary.batches_attempted, 3);
    assert_eq!(summary.batches_failed, 0);
    assert!(summary.is_success());
    assert_eq!(mirror.row_count("conversations"), 120);
    assert_eq!(stats.sync_count(), 120);
}

#[tokio::test]
async fn test_sync_table_respects_limit() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(250);
    let (syncer, _) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let summary = syncer.sync_table("conversations", 100).await.unwrap();

    assert_eq!(summary.rows_read, 100);
    assert_eq!(mirror.upsert_calls(), vec![50, 50]);
    // The bounded read is taken from the start of the key order
    assert!(mirror.row("conversations", "1").is_some());
    assert!(mirror.row("conversations", "101").is_none());
}

#[tokio::test]
async fn test_failed_batch_does_not_stop_the_others() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(120);
    mirror.fail_upsert_call(1);
    let (syncer, stats) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let summary = syncer.sync_table("conversations", 120).await.unwrap();

    assert_eq!(mirror.upsert_calls(), vec![50, 50, 20]);
    assert_eq!(summary.batches_attempted, 3);
    assert_eq!(summary.batches_failed, 1);
    assert_eq!(summary.rows_written, 70);
    assert!(!summary.is_success());
    assert!(summary.errors[0].contains("batch 2"));

    // Batches 1 and 3 are kept, nothing is rolled back
    assert!(mirror.row("conversations", "1").is_some());
    assert!(mirror.row("conversations", "75").is_none());
    assert!(mirror.row("conversations", "120").is_some());
    assert_eq!(stats.sync_count(), 70);
    assert_eq!(stats.error_count(), 1);
}

#[tokio::test]
async fn test_bulk_rows_are_coerced() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.insert(
        "notes",
        json!({"id": 1, "tags": "[\"a\",\"b\"]", "title": "x"}),
    );
    source.insert("notes", json!({"id": 2, "tags": "plain-tag", "title": "y"}));
    let (syncer, _) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    syncer.sync_table("notes", 100).await.unwrap();

    assert_eq!(mirror.upsert_calls(), vec![2]);
    assert_eq!(mirror.row("notes", "1").unwrap()["tags"], json!(["a", "b"]));
    assert_eq!(mirror.row("notes", "2").unwrap()["tags"], json!(["plain-tag"]));
    // Every row carries the full column set
    assert_eq!(mirror.row("notes", "2").unwrap().len(), 7);
}

#[tokio::test]
async fn test_unknown_table_is_an_error() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    let (syncer, _) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let err = syncer.sync_table("payments", 10).await.unwrap_err();
    assert!(err.to_string().contains("payments"));
    assert_eq!(mirror.write_count(), 0);
}

#[tokio::test]
async fn test_empty_table_writes_nothing() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    let (syncer, _) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let summary = syncer.sync_table("notes", 100).await.unwrap();
    assert_eq!(summary.rows_read, 0);
    assert_eq!(summary.batches_attempted, 0);
    assert!(mirror.upsert_calls().is_empty());
}

#[tokio::test]
async fn test_sync_all_continues_after_read_failure() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(3);
    source.insert("user_profiles", json!({"user_id": "u1", "display_name": "Ada"}));
    source.insert("notes", json!({"id": 1, "title": "n"}));
    // The first table's read fails; the rest still run
    source.fail_next_reads(1);
    let (syncer, stats) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let report = syncer.sync_all(100).await;

    let tables: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(tables, vec!["conversations", "user_profiles", "notes"]);
    assert!(!report.tables[0].is_success());
    assert!(report.tables[0].errors[0].contains("statement timeout"));
    assert!(report.tables[1].is_success());
    assert!(report.tables[2].is_success());
    assert_eq!(report.rows_written(), 2);
    assert!(!report.is_success());
    assert_eq!(stats.error_count(), 1);
}

#[tokio::test]
async fn test_backfill_paginates_until_short_page() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(45);
    // Batch size 2 gives pages of 40 rows
    let (syncer, _) = syncer(&source, &mirror, 2);

    let summary = syncer.backfill_table("conversations").await.unwrap();

    assert_eq!(summary.rows_read, 45);
    assert_eq!(summary.rows_written, 45);
    assert_eq!(summary.batches_attempted, 23);
    assert_eq!(mirror.row_count("conversations"), 45);
}

#[tokio::test]
async fn test_backfill_exact_page_multiple_reads_one_empty_page() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(40);
    let (syncer, _) = syncer(&source, &mirror, 2);

    let summary = syncer.backfill_table("conversations").await.unwrap();

    assert_eq!(summary.rows_read, 40);
    assert_eq!(summary.batches_attempted, 20);
    assert!(summary.is_success());
}

#[tokio::test]
async fn test_backfill_keeps_written_pages_when_a_later_read_fails() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(100);
    source.fail_page_at(40);
    let (syncer, _) = syncer(&source, &mirror, 2);

    let summary = syncer.backfill_table("conversations").await.unwrap();

    assert_eq!(summary.rows_read, 40);
    assert_eq!(summary.rows_written, 40);
    assert!(!summary.is_success());
    assert!(summary.errors[0].contains("offset 40"));
    assert_eq!(mirror.row_count("conversations"), 40);
}

#[tokio::test]
async fn test_backfill_all_covers_every_table() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(5);
    source.insert("notes", json!({"id": 1}));
    let (syncer, _) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    let report = syncer.backfill_all().await;

    assert_eq!(report.tables.len(), 3);
    assert!(report.is_success());
    assert_eq!(report.rows_written(), 6);
    assert_eq!(mirror.row_count("user_profiles"), 0);
}

#[tokio::test]
async fn test_failed_single_table_read_is_counted() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(3);
    let (syncer, stats) = syncer(&source, &mirror, DEFAULT_BATCH_SIZE);

    source.fail_next_reads(1);
    let err = syncer.sync_table("conversations", 100).await.unwrap_err();
    assert!(format!("{:#}", err).contains("statement timeout"));
    assert_eq!(stats.error_count(), 1);

    source.fail_next_reads(1);
    assert!(syncer.backfill_table("conversations").await.is_err());
    assert_eq!(stats.error_count(), 2);
    let health = stats.snapshot(false, vec![]);
    assert!(health.last_error.unwrap().contains("conversations"));
    assert_eq!(mirror.write_count(), 0);
}

#[tokio::test]
async fn test_later_page_read_failure_is_counted() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(100);
    source.fail_page_at(40);
    let (syncer, stats) = syncer(&source, &mirror, 2);

    syncer.backfill_table("conversations").await.unwrap();

    assert_eq!(stats.error_count(), 1);
    assert_eq!(stats.sync_count(), 40);
}

#[tokio::test]
async fn test_huge_batch_size_backfills_in_one_page() {
    let source = FakeSource::new();
    let mirror = FakeMirror::new();
    source.seed_conversations(5);
    let (syncer, _) = syncer(&source, &mirror, usize::MAX);

    let summary = syncer.backfill_table("conversations").await.unwrap();

    assert_eq!(summary.rows_written, 5);
    assert_eq!(mirror.upsert_calls(), vec![5]);
}
