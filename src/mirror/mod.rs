// ABOUTME: Write-side abstraction over the mirror store
// ABOUTME: Upsert-by-primary-key and delete-by-primary-key against REST or PostgreSQL mirrors

pub mod postgres;
pub mod rest;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::MirrorTarget;
use crate::registry::TableSyncConfig;
use crate::source::Record;

pub use postgres::PgMirror;
pub use rest::RestMirror;

/// Applies rows to the mirror.
///
/// Both operations are idempotent: upserts overwrite on conflict and deleting
/// an absent row succeeds.
#[async_trait]
pub trait MirrorWriter: Send + Sync {
    /// Upsert `records` in a single request, keyed on the table's primary key.
    async fn upsert(&self, table: &TableSyncConfig, records: &[Record]) -> Result<()>;

    /// Delete the row whose primary key equals `key`.
    async fn delete(&self, table: &TableSyncConfig, key: &str) -> Result<()>;
}

/// Build the writer for a configured mirror target.
pub fn open_mirror(target: &MirrorTarget) -> Result<Arc<dyn MirrorWriter>> {
    match target {
        MirrorTarget::Rest { url, api_key } => {
            Ok(Arc::new(RestMirror::new(url, api_key.clone())?))
        }
        MirrorTarget::Postgres { url } => Ok(Arc::new(PgMirror::new(url.clone()))),
    }
}
