// ABOUTME: PostgreSQL mirror writer - applies rows to a target PostgreSQL database
// ABOUTME: Uses INSERT ... ON CONFLICT DO UPDATE fed from jsonb_populate_recordset

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use super::MirrorWriter;
use crate::postgres::connection::{classify_query_error, ManagedClient};
use crate::postgres::fetcher::{key_document, key_predicate};
use crate::registry::TableSyncConfig;
use crate::source::Record;
use crate::utils::{quote_ident, quote_qualified};

/// Writes to a mirror PostgreSQL database.
///
/// A whole batch travels as one JSONB array parameter and is expanded with
/// `jsonb_populate_recordset` against the mirror table's row type, so the
/// statement text only depends on the table, never on the batch size.
pub struct PgMirror {
    client: ManagedClient,
}

impl PgMirror {
    pub fn new(url: String) -> Self {
        Self {
            client: ManagedClient::new(url),
        }
    }
}

#[async_trait]
impl MirrorWriter for PgMirror {
    async fn upsert(&self, table: &TableSyncConfig, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let client = self.client.get().await?;
        let query = build_upsert_query(
            &table.schema,
            table.mirror_table(),
            &table.primary_key,
            &table.column_names(),
        );
        let rows = Value::Array(records.iter().cloned().map(Value::Object).collect());

        client
            .execute(&query, &[&rows])
            .await
            .map_err(classify_query_error)
            .with_context(|| {
                format!(
                    "Failed to upsert {} rows into {}.{}",
                    records.len(),
                    table.schema,
                    table.mirror_table()
                )
            })?;

        Ok(())
    }

    async fn delete(&self, table: &TableSyncConfig, key: &str) -> Result<()> {
        let client = self.client.get().await?;
        let query = build_delete_query(&table.schema, table.mirror_table(), &table.primary_key);
        let key_param = key_document(table, key);

        client
            .execute(&query, &[&key_param])
            .await
            .map_err(classify_query_error)
            .with_context(|| {
                format!(
                    "Failed to delete {} = {} from {}.{}",
                    table.primary_key,
                    key,
                    table.schema,
                    table.mirror_table()
                )
            })?;

        Ok(())
    }
}

/// Build an upsert query for the mirror table.
///
/// Generates a query like:
/// ```sql
/// INSERT INTO "schema"."table" ("id", "name")
/// SELECT "id", "name" FROM jsonb_populate_recordset(NULL::"schema"."table", $1::jsonb)
/// ON CONFLICT ("id") DO UPDATE SET "name" = EXCLUDED."name"
/// ```
fn build_upsert_query(schema: &str, table: &str, primary_key: &str, columns: &[&str]) -> String {
    let qualified = quote_qualified(schema, table);
    let quoted_columns = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");

    let mut update_columns: Vec<String> = columns
        .iter()
        .filter(|c| **c != primary_key)
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    // Key-only tables still overwrite on conflict rather than ignoring it
    if update_columns.is_empty() {
        let pk = quote_ident(primary_key);
        update_columns.push(format!("{} = EXCLUDED.{}", pk, pk));
    }

    format!(
        "INSERT INTO {} ({}) SELECT {} FROM jsonb_populate_recordset(NULL::{}, $1::jsonb) \
         ON CONFLICT ({}) DO UPDATE SET {}",
        qualified,
        quoted_columns,
        quoted_columns,
        qualified,
        quote_ident(primary_key),
        update_columns.join(", ")
    )
}

/// ```sql
/// DELETE FROM "schema"."table" WHERE "id" = (SELECT r."id" FROM jsonb_populate_record(...) r)
/// ```
fn build_delete_query(schema: &str, table: &str, primary_key: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {}",
        quote_qualified(schema, table),
        key_predicate(schema, table, primary_key)
    )
}
