// ABOUTME: Per-record sync pipeline: fetch from primary, coerce, write to mirror
// ABOUTME: Wraps each change in bounded retries and reports a SyncOutcome to stats

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::coercer::coerce_record;
use crate::mirror::MirrorWriter;
use crate::notification::{ChangeNotification, ChangeOperation};
use crate::registry::{TableRegistry, TableSyncConfig};
use crate::retry::{is_permanent, retry_with_backoff, RetryPolicy};
use crate::source::RecordSource;
use crate::stats::{StatsTracker, SyncOutcome};

/// What a single successful pass did to the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Deleted,
    /// The row was gone from the primary by the time it was fetched.
    Missing,
}

/// Makes the mirror match the primary for one row at a time.
pub struct SyncPipeline {
    registry: Arc<TableRegistry>,
    source: Arc<dyn RecordSource>,
    mirror: Arc<dyn MirrorWriter>,
    retry: RetryPolicy,
    stats: Arc<StatsTracker>,
    key_locks: Option<KeyLocks>,
}

impl SyncPipeline {
    pub fn new(
        registry: Arc<TableRegistry>,
        source: Arc<dyn RecordSource>,
        mirror: Arc<dyn MirrorWriter>,
        retry: RetryPolicy,
        stats: Arc<StatsTracker>,
    ) -> Self {
        Self {
            registry,
            source,
            mirror,
            retry,
            stats,
            key_locks: None,
        }
    }

    /// Serialize fetch+write for notifications that share `(table, key)`.
    ///
    /// Without this, two changes to one row may complete out of order and the
    /// mirror only converges on some state the row held.
    pub fn with_key_serialization(mut self) -> Self {
        self.key_locks = Some(KeyLocks::default());
        self
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    /// Sync one change with retries. Never returns an error: failures are
    /// contained in the outcome, logged, and counted.
    pub async fn process(&self, change: &ChangeNotification) -> SyncOutcome {
        let start = Instant::now();

        let result = match self.registry.get(&change.table_name) {
            Some(table) => self.process_with_retry(table, change).await,
            None => Err(anyhow!("table '{}' is not registered", change.table_name)),
        };

        let outcome = SyncOutcome {
            table_name: change.table_name.clone(),
            primary_key_value: change.primary_key_value.clone(),
            operation: change.operation,
            success: result.is_ok(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: result.as_ref().err().map(|e| format!("{:#}", e)),
        };

        match &result {
            Ok(Applied::Missing) => tracing::warn!(
                "{} not found in primary, skipping mirror write ({}ms)",
                change,
                outcome.duration_ms
            ),
            Ok(applied) => tracing::debug!(
                "Synced {} ({:?}, {}ms)",
                change,
                applied,
                outcome.duration_ms
            ),
            Err(e) if is_permanent(e) => {
                tracing::error!("Failed to sync {}, not retrying: {:#}", change, e)
            }
            Err(e) => tracing::error!(
                "Failed to sync {} after {} attempts: {:#}",
                change,
                self.retry.max_attempts.max(1),
                e
            ),
        }

        self.stats.record(&outcome);
        outcome
    }

    async fn process_with_retry(
        &self,
        table: &TableSyncConfig,
        change: &ChangeNotification,
    ) -> Result<Applied> {
        let label = change.to_string();
        match &self.key_locks {
            Some(locks) => {
                let key = (change.table_name.clone(), change.primary_key_value.clone());
                let handle = locks.handle(&key);
                let result = {
                    let _guard = handle.lock().await;
                    retry_with_backoff(&self.retry, &label, || self.apply_once(table, change)).await
                };
                drop(handle);
                locks.release(&key);
                result
            }
            None => retry_with_backoff(&self.retry, &label, || self.apply_once(table, change)).await,
        }
    }

    /// One attempt, with no retries.
    pub async fn apply_once(
        &self,
        table: &TableSyncConfig,
        change: &ChangeNotification,
    ) -> Result<Applied> {
        match change.operation {
            ChangeOperation::Insert | ChangeOperation::Update => {
                let Some(record) = self
                    .source
                    .fetch_record(table, &change.primary_key_value)
                    .await?
                else {
                    return Ok(Applied::Missing);
                };

                let record = coerce_record(table, record);
                self.mirror.upsert(table, std::slice::from_ref(&record)).await?;
                Ok(Applied::Upserted)
            }
            ChangeOperation::Delete => {
                self.mirror
                    .delete(table, &change.primary_key_value)
                    .await?;
                Ok(Applied::Deleted)
            }
        }
    }
}

type RowKey = (String, String);

/// Async mutexes keyed by `(table, primary key)`, dropped once unused.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<RowKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    fn handle(&self, key: &RowKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(map.entry(key.clone()).or_default())
    }

    /// Remove the entry if only the map still references it.
    fn release(&self, key: &RowKey) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }
}
