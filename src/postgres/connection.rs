// ABOUTME: PostgreSQL connection helpers shared by the fetcher, mirror, and listener
// ABOUTME: TLS policy, one-shot connects, query error classification, and a reconnecting client

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;

use crate::retry::Permanent;
use crate::utils::redact_url;

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy. Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed).is_err() {
        tracing::debug!("TLS policy already initialized, ignoring");
    }
}

fn allow_self_signed() -> bool {
    ALLOW_SELF_SIGNED.get().copied().unwrap_or(false)
}

/// Build the TLS connector used for every PostgreSQL connection.
///
/// `sslmode` in the connection string still decides whether TLS is used;
/// this only controls certificate verification.
pub fn make_tls_connector() -> Result<MakeTlsConnector> {
    let mut builder = TlsConnector::builder();
    if allow_self_signed() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    let connector = builder.build().context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Open a connection and drive it on a background task.
pub async fn connect(url: &str) -> Result<Client> {
    let tls = make_tls_connector()?;
    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", redact_url(url)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Convert a query error, marking data exceptions as `Permanent`.
pub fn classify_query_error(error: tokio_postgres::Error) -> anyhow::Error {
    let permanent = error.code().is_some_and(is_data_exception);
    let error = anyhow::Error::new(error);
    if permanent {
        error.context(Permanent)
    } else {
        error
    }
}

/// SQLSTATE class 22: the statement's input is invalid, e.g. a key that
/// does not cast to the column type (22P02).
fn is_data_exception(state: &SqlState) -> bool {
    state.code().starts_with("22")
}

/// A shared client that transparently reconnects once the previous
/// connection has closed.
///
/// Queries from concurrent tasks are pipelined over the single connection.
pub struct ManagedClient {
    url: String,
    client: Mutex<Option<Arc<Client>>>,
}

impl ManagedClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Mutex::new(None),
        }
    }

    /// Return the live client, connecting if there is none or it has closed.
    pub async fn get(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(Arc::clone(client));
            }
            tracing::warn!(
                "Connection to {} closed, reconnecting",
                redact_url(&self.url)
            );
        }

        let client = Arc::new(connect(&self.url).await?);
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }
}
