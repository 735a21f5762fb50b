// ABOUTME: BulkSyncer - whole-table synchronization for seeding and recovery
// ABOUTME: Reads rows in primary-key order and upserts them into the mirror in batches

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

use crate::coercer::coerce_record;
use crate::mirror::MirrorWriter;
use crate::registry::{TableRegistry, TableSyncConfig};
use crate::source::{Record, RecordSource};
use crate::stats::StatsTracker;

/// Row limit for an ad hoc manual sync.
pub const DEFAULT_MANUAL_LIMIT: usize = 100;
/// Rows per mirror upsert request.
pub const DEFAULT_BATCH_SIZE: usize = 50;
/// Batches read per page during a full backfill.
const BATCHES_PER_PAGE: usize = 20;

/// What one table's bulk sync did. Partial success is expected and visible here.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSyncSummary {
    pub table: String,
    pub rows_read: u64,
    pub batches_attempted: u64,
    pub batches_failed: u64,
    pub rows_written: u64,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl TableSyncSummary {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-table summaries for a multi-table run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkSyncReport {
    pub tables: Vec<TableSyncSummary>,
    pub duration_ms: u64,
}

impl BulkSyncReport {
    pub fn rows_read(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_read).sum()
    }

    pub fn rows_written(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_written).sum()
    }

    pub fn batches_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.batches_failed).sum()
    }

    pub fn is_success(&self) -> bool {
        self.tables.iter().all(|t| t.is_success())
    }
}

/// Copies whole tables from the primary into the mirror.
///
/// Tables are processed sequentially in registry order. Each batch is one
/// mirror request; a failed batch is logged and counted, and the remaining
/// batches still run. Nothing is rolled back.
pub struct BulkSyncer {
    registry: Arc<TableRegistry>,
    source: Arc<dyn RecordSource>,
    mirror: Arc<dyn MirrorWriter>,
    stats: Arc<StatsTracker>,
    batch_size: usize,
}

impl BulkSyncer {
    pub fn new(
        registry: Arc<TableRegistry>,
        source: Arc<dyn RecordSource>,
        mirror: Arc<dyn MirrorWriter>,
        stats: Arc<StatsTracker>,
        batch_size: usize,
    ) -> Self {
        Self {
            registry,
            source,
            mirror,
            stats,
            batch_size: batch_size.max(1),
        }
    }

    /// Bounded sync of every registered table.
    pub async fn sync_all(&self, limit: usize) -> BulkSyncReport {
        let start = Instant::now();
        let mut report = BulkSyncReport::default();

        for table in self.registry.tables() {
            let summary = match self.sync_table(&table.table_name, limit).await {
                Ok(summary) => summary,
                Err(e) => self.failed_summary(table, e),
            };
            report.tables.push(summary);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        log_report("Manual sync", &report);
        report
    }

    /// Read up to `limit` rows ordered by primary key in one read and upsert
    /// them in batches.
    pub async fn sync_table(&self, table_name: &str, limit: usize) -> Result<TableSyncSummary> {
        let table = self.table(table_name)?;
        let start = Instant::now();
        let mut summary = TableSyncSummary::new(&table.table_name);

        tracing::info!(
            "Syncing up to {} rows of {} (batch size: {})",
            limit,
            table.qualified_name(),
            self.batch_size
        );

        let records = match self.source.fetch_page(table, 0, limit as u64).await {
            Ok(records) => records,
            Err(e) => return Err(self.read_failed(table, 0, e)),
        };
        summary.rows_read = records.len() as u64;
        self.write_batches(table, records, &mut summary).await;

        summary.duration_ms = start.elapsed().as_millis() as u64;
        log_summary(&summary);
        Ok(summary)
    }

    /// Paginate through every registered table.
    pub async fn backfill_all(&self) -> BulkSyncReport {
        let start = Instant::now();
        let mut report = BulkSyncReport::default();

        for table in self.registry.tables() {
            let summary = match self.backfill_table(&table.table_name).await {
                Ok(summary) => summary,
                Err(e) => self.failed_summary(table, e),
            };
            report.tables.push(summary);
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        log_report("Backfill", &report);
        report
    }

    /// Copy an entire table, one page at a time, until a short page is read.
    ///
    /// A failed page read stops the table; rows already written stay written.
    pub async fn backfill_table(&self, table_name: &str) -> Result<TableSyncSummary> {
        let table = self.table(table_name)?;
        let start = Instant::now();
        let mut summary = TableSyncSummary::new(&table.table_name);
        let page_size = self.batch_size.saturating_mul(BATCHES_PER_PAGE) as u64;
        let mut offset = 0u64;

        tracing::info!(
            "Starting backfill of {} (page size: {}, batch size: {})",
            table.qualified_name(),
            page_size,
            self.batch_size
        );

        loop {
            let records = match self.source.fetch_page(table, offset, page_size).await {
                Ok(records) => records,
                Err(e) if summary.rows_read > 0 => {
                    let message = format!("read at offset {} failed: {:#}", offset, e);
                    tracing::error!("Backfill of {} stopped: {}", table.table_name, message);
                    self.stats
                        .record_error(format!("bulk {}: {}", table.table_name, message));
                    summary.errors.push(message);
                    break;
                }
                Err(e) => return Err(self.read_failed(table, offset, e)),
            };

            let page_len = records.len() as u64;
            summary.rows_read += page_len;
            offset += page_len;
            self.write_batches(table, records, &mut summary).await;

            tracing::info!(
                "Progress: {} - {} rows read, {} written",
                table.table_name,
                summary.rows_read,
                summary.rows_written
            );

            if page_len < page_size {
                break;
            }
        }

        summary.duration_ms = start.elapsed().as_millis() as u64;
        log_summary(&summary);
        Ok(summary)
    }

    async fn write_batches(
        &self,
        table: &TableSyncConfig,
        records: Vec<Record>,
        summary: &mut TableSyncSummary,
    ) {
        let records: Vec<Record> = records
            .into_iter()
            .map(|record| coerce_record(table, record))
            .collect();

        for (index, batch) in records.chunks(self.batch_size).enumerate() {
            summary.batches_attempted += 1;
            match self.mirror.upsert(table, batch).await {
                Ok(()) => {
                    summary.rows_written += batch.len() as u64;
                    self.stats.record_success(batch.len() as u64);
                }
                Err(e) => {
                    let message = format!(
                        "batch {} ({} rows) failed: {:#}",
                        index + 1,
                        batch.len(),
                        e
                    );
                    tracing::error!("Bulk sync of {}: {}", table.table_name, message);
                    self.stats
                        .record_error(format!("bulk {}: {}", table.table_name, message));
                    summary.batches_failed += 1;
                    summary.errors.push(message);
                }
            }
        }
    }

    fn table(&self, table_name: &str) -> Result<&TableSyncConfig> {
        self.registry
            .get(table_name)
            .ok_or_else(|| anyhow!("Table '{}' is not in the sync registry", table_name))
    }

    /// Count a failed table read. Returns the error for the caller to raise.
    fn read_failed(
        &self,
        table: &TableSyncConfig,
        offset: u64,
        error: anyhow::Error,
    ) -> anyhow::Error {
        let error = error.context(format!(
            "Failed to read {} at offset {}",
            table.qualified_name(),
            offset
        ));
        self.stats
            .record_error(format!("bulk {}: {:#}", table.table_name, error));
        error
    }

    /// Summary for a table whose read failed; the failure is already counted.
    fn failed_summary(&self, table: &TableSyncConfig, error: anyhow::Error) -> TableSyncSummary {
        let message = format!("{:#}", error);
        tracing::error!("Failed to sync {}: {}", table.qualified_name(), message);
        TableSyncSummary {
            errors: vec![message],
            ..TableSyncSummary::new(&table.table_name)
        }
    }
}

fn log_summary(summary: &TableSyncSummary) {
    if summary.batches_failed > 0 {
        tracing::warn!(
            "Completed sync for {} with failures: {} rows read, {} written, {}/{} batches failed in {}ms",
            summary.table,
            summary.rows_read,
            summary.rows_written,
            summary.batches_failed,
            summary.batches_attempted,
            summary.duration_ms
        );
    } else {
        tracing::info!(
            "Completed sync for {}: {} rows in {} batches ({}ms)",
            summary.table,
            summary.rows_written,
            summary.batches_attempted,
            summary.duration_ms
        );
    }
}

fn log_report(label: &str, report: &BulkSyncReport) {
    tracing::info!(
        "{} completed: {} tables, {} rows read, {} written, {} failed batches in {}ms",
        label,
        report.tables.len(),
        report.rows_read(),
        report.rows_written(),
        report.batches_failed(),
        report.duration_ms
    );
}
