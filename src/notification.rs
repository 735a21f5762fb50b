// ABOUTME: Change notification types and payload decoding
// ABOUTME: Turns raw "<OPERATION>:<key>" channel payloads into typed change events

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::registry::{TableRegistry, TableSyncConfig};
use crate::utils::sanitize_identifier;

/// Row-level operation reported by the primary's trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "INSERT",
            ChangeOperation::Update => "UPDATE",
            ChangeOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeOperation {
    type Err = DecodeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "INSERT" => Ok(ChangeOperation::Insert),
            "UPDATE" => Ok(ChangeOperation::Update),
            "DELETE" => Ok(ChangeOperation::Delete),
            other => Err(DecodeError::UnknownOperation(other.to_string())),
        }
    }
}

/// Why a notification payload was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty notification payload")]
    Empty,
    #[error("payload '{0}' has no ':' separator")]
    MissingSeparator(String),
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),
    #[error("payload has an empty primary key")]
    EmptyKey,
}

/// A notification as delivered on the subscription connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

impl RawNotification {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// A decoded unit of work for the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeNotification {
    pub table_name: String,
    pub operation: ChangeOperation,
    pub primary_key_value: String,
}

impl ChangeNotification {
    pub fn new(table_name: &str, operation: ChangeOperation, primary_key_value: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            operation,
            primary_key_value: primary_key_value.to_string(),
        }
    }
}

impl fmt::Display for ChangeNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}",
            self.operation, self.table_name, self.primary_key_value
        )
    }
}

/// Decode a payload for a table.
///
/// The wire format is `<OPERATION>:<primaryKeyValue>`. Triggers that also
/// embed the table name (`INSERT:conversations:42`) are accepted when the
/// middle segment names the owning table. Everything after the first
/// separator is otherwise the key, so keys may themselves contain `:`.
pub fn decode_payload(
    table: &TableSyncConfig,
    payload: &str,
) -> Result<ChangeNotification, DecodeError> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }

    let (operation, rest) = payload
        .split_once(':')
        .ok_or_else(|| DecodeError::MissingSeparator(sanitize_identifier(payload)))?;
    let operation: ChangeOperation = operation.parse()?;

    let key = rest
        .strip_prefix(table.table_name.as_str())
        .and_then(|r| r.strip_prefix(':'))
        .unwrap_or(rest);

    if key.is_empty() {
        return Err(DecodeError::EmptyKey);
    }

    Ok(ChangeNotification {
        table_name: table.table_name.clone(),
        operation,
        primary_key_value: key.to_string(),
    })
}

/// Resolve a raw notification against the registry.
///
/// Unknown channels and malformed payloads are logged and dropped; `None`
/// means the notification must not reach the pipeline.
pub fn route(registry: &TableRegistry, raw: &RawNotification) -> Option<ChangeNotification> {
    let Some(table) = registry.by_channel(&raw.channel) else {
        tracing::warn!(
            "Discarding notification on unknown channel '{}'",
            sanitize_identifier(&raw.channel)
        );
        return None;
    };

    match decode_payload(table, &raw.payload) {
        Ok(change) => Some(change),
        Err(e) => {
            tracing::warn!(
                "Discarding malformed notification for {} on '{}': {}",
                table.table_name,
                raw.channel,
                e
            );
            None
        }
    }
}
