// ABOUTME: RecordSource implementation backed by the primary PostgreSQL database
// ABOUTME: Reads projected rows as JSON by primary key or in primary-key order

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_postgres::Row;

use super::connection::{classify_query_error, ManagedClient};
use crate::registry::TableSyncConfig;
use crate::source::{Record, RecordSource};
use crate::utils::{quote_ident, quote_qualified};

/// Reads rows from the primary store.
///
/// Rows are returned through `to_jsonb`, so column types never need to be
/// known on the client side. The primary key is matched by populating a
/// record of the table's own row type, which casts the textual key to the
/// column's real type and keeps the lookup on the primary key index.
pub struct PgRecordSource {
    client: ManagedClient,
}

impl PgRecordSource {
    pub fn new(url: String) -> Self {
        Self {
            client: ManagedClient::new(url),
        }
    }
}

#[async_trait]
impl RecordSource for PgRecordSource {
    async fn fetch_record(&self, table: &TableSyncConfig, key: &str) -> Result<Option<Record>> {
        let client = self.client.get().await?;
        let query = build_fetch_by_key_query(table);
        let key_param = key_document(table, key);

        let row = client
            .query_opt(&query, &[&key_param])
            .await
            .map_err(classify_query_error)
            .with_context(|| {
                format!(
                    "Failed to fetch {} where {} = {}",
                    table.qualified_name(),
                    table.primary_key,
                    key
                )
            })?;

        row.map(|row| row_to_record(&row)).transpose()
    }

    async fn fetch_page(
        &self,
        table: &TableSyncConfig,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>> {
        let client = self.client.get().await?;
        let query = build_fetch_page_query(table);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).context("Page offset out of range")?;

        let rows = client
            .query(&query, &[&limit, &offset])
            .await
            .map_err(classify_query_error)
            .with_context(|| {
                format!(
                    "Failed to read {} (offset {}, limit {})",
                    table.qualified_name(),
                    offset,
                    limit
                )
            })?;

        rows.iter().map(row_to_record).collect()
    }
}

/// `{"<pk>": "<key>"}`, the argument to `jsonb_populate_record`.
pub(crate) fn key_document(table: &TableSyncConfig, key: &str) -> Value {
    let mut doc = serde_json::Map::new();
    doc.insert(table.primary_key.clone(), Value::String(key.to_string()));
    Value::Object(doc)
}

/// Typed primary-key match against `$1`, built from the row type of
/// `"schema"."table"`.
pub(crate) fn key_predicate(schema: &str, table: &str, primary_key: &str) -> String {
    let pk = quote_ident(primary_key);
    format!(
        "{pk} = (SELECT r.{pk} FROM jsonb_populate_record(NULL::{}, $1::jsonb) r)",
        quote_qualified(schema, table)
    )
}

fn projection(table: &TableSyncConfig) -> String {
    table
        .column_names()
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// ```sql
/// SELECT to_jsonb(t) FROM (
///   SELECT "id", "user_message" FROM "public"."conversations"
///   WHERE "id" = (SELECT r."id" FROM jsonb_populate_record(NULL::"public"."conversations", $1::jsonb) r)
/// ) t
/// ```
fn build_fetch_by_key_query(table: &TableSyncConfig) -> String {
    format!(
        "SELECT to_jsonb(t) FROM (SELECT {} FROM {} WHERE {}) t",
        projection(table),
        quote_qualified(&table.schema, &table.table_name),
        key_predicate(&table.schema, &table.table_name, &table.primary_key)
    )
}

/// ```sql
/// SELECT to_jsonb(t) FROM (SELECT "id", ... FROM "public"."conversations") t
/// ORDER BY t."id" LIMIT $1 OFFSET $2
/// ```
fn build_fetch_page_query(table: &TableSyncConfig) -> String {
    format!(
        "SELECT to_jsonb(t) FROM (SELECT {} FROM {}) t ORDER BY t.{} LIMIT $1 OFFSET $2",
        projection(table),
        quote_qualified(&table.schema, &table.table_name),
        quote_ident(&table.primary_key)
    )
}

fn row_to_record(row: &Row) -> Result<Record> {
    let value: Value = row
        .try_get(0)
        .context("Failed to decode row as JSON")?;
    match value {
        Value::Object(record) => Ok(record),
        other => bail!("Expected a JSON object row, got {}", other),
    }
}
