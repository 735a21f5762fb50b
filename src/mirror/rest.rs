// ABOUTME: HTTP mirror writer for PostgREST-compatible endpoints (e.g. Supabase)
// ABOUTME: Upserts with merge-duplicates resolution and deletes with eq filters

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use url::Url;

use super::MirrorWriter;
use crate::registry::TableSyncConfig;
use crate::retry::Permanent;
use crate::source::Record;

const REST_PATH: &str = "rest/v1/";

/// Writes to a PostgREST API.
///
/// Upserts are `POST /rest/v1/<table>?on_conflict=<pk>` with
/// `Prefer: resolution=merge-duplicates`, so conflicting rows are overwritten
/// rather than ignored. Tables outside `public` are addressed through the
/// `Content-Profile` header.
pub struct RestMirror {
    client: Client,
    base_url: Url,
    api_key: String,
}

impl RestMirror {
    pub fn new(url: &str, api_key: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: rest_base_url(url)?,
            api_key,
        })
    }

    fn endpoint(&self, table: &TableSyncConfig) -> Result<Url> {
        self.base_url
            .join(table.mirror_table())
            .with_context(|| format!("Invalid mirror endpoint for {}", table.mirror_table()))
    }

    fn authorize(&self, request: RequestBuilder, table: &TableSyncConfig) -> RequestBuilder {
        let request = request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key);
        if table.schema == "public" {
            request
        } else {
            request.header("Content-Profile", &table.schema)
        }
    }
}

#[async_trait]
impl MirrorWriter for RestMirror {
    async fn upsert(&self, table: &TableSyncConfig, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut url = self.endpoint(table)?;
        url.query_pairs_mut()
            .append_pair("on_conflict", &table.primary_key);

        let request = self
            .client
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(records);

        let response = self
            .authorize(request, table)
            .send()
            .await
            .with_context(|| format!("Failed to send upsert for {}", table.mirror_table()))?;

        check_response(response, "upsert", table).await
    }

    async fn delete(&self, table: &TableSyncConfig, key: &str) -> Result<()> {
        let mut url = self.endpoint(table)?;
        url.query_pairs_mut()
            .append_pair(&table.primary_key, &format!("eq.{}", key));

        let request = self
            .client
            .delete(url)
            .header("Prefer", "return=minimal");

        let response = self
            .authorize(request, table)
            .send()
            .await
            .with_context(|| format!("Failed to send delete for {}", table.mirror_table()))?;

        check_response(response, "delete", table).await
    }
}

async fn check_response(response: Response, action: &str, table: &TableSyncConfig) -> Result<()> {
    if response.status().is_success() {
        return Ok(());
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let error = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        anyhow!(
            "Mirror rejected credentials for {} on {} ({}). Check MIRROR_API_KEY",
            action,
            table.mirror_table(),
            status
        )
    } else {
        anyhow!(
            "Mirror {} on {} failed with status {}: {}",
            action,
            table.mirror_table(),
            status,
            body
        )
    };

    if is_permanent_status(status) {
        Err(error.context(Permanent))
    } else {
        Err(error)
    }
}

/// Client errors repeat on retry, except timeouts and rate limiting.
fn is_permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

/// Normalize a project URL into the `/rest/v1/` base all table paths join onto.
fn rest_base_url(url: &str) -> Result<Url> {
    let mut base = Url::parse(url).with_context(|| format!("Invalid mirror URL '{}'", url))?;
    if base.scheme() != "http" && base.scheme() != "https" {
        bail!("Mirror URL must use http or https, got '{}'", base.scheme());
    }

    let path = base.path().trim_end_matches('/').to_string();
    let path = if path.ends_with("/rest/v1") {
        format!("{}/", path)
    } else {
        format!("{}/{}", path, REST_PATH)
    };
    base.set_path(&path);
    base.set_query(None);
    Ok(base)
}
