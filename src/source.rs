// ABOUTME: Read-side abstraction over the primary store
// ABOUTME: Point reads by primary key and ordered range reads for bulk sync

use anyhow::Result;
use async_trait::async_trait;

use crate::registry::TableSyncConfig;

/// A row as a column-name → JSON value map.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Reads current rows from the primary (authoritative) store.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch the projected row for `key`, or `None` when it no longer exists.
    async fn fetch_record(&self, table: &TableSyncConfig, key: &str) -> Result<Option<Record>>;

    /// Fetch up to `limit` rows ordered by primary key, skipping `offset`.
    async fn fetch_page(
        &self,
        table: &TableSyncConfig,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>>;
}
