// ABOUTME: Value coercion between primary-store rows and mirror rows
// ABOUTME: Projects records onto the configured columns and reshapes array/JSON values

use serde_json::Value;

use crate::registry::{ColumnKind, TableSyncConfig};
use crate::source::Record;

/// Normalize a single value according to its declared column kind.
///
/// Array columns may arrive as native arrays or as string-encoded arrays,
/// depending on the client library on each side. A string that does not
/// decode to an array is wrapped as a one-element array, never dropped.
pub fn coerce_value(kind: ColumnKind, value: Value) -> Value {
    match kind {
        ColumnKind::Scalar => value,
        ColumnKind::Array => match value {
            Value::Null | Value::Array(_) => value,
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Array(items)) => Value::Array(items),
                _ => Value::Array(vec![Value::String(raw)]),
            },
            other => Value::Array(vec![other]),
        },
        ColumnKind::Json => match value {
            Value::String(raw) => serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw)),
            other => other,
        },
    }
}

/// Project a record onto the table's columns and coerce every field.
///
/// Columns missing from the source record become `null` so that all rows in a
/// batch carry the same key set.
pub fn coerce_record(table: &TableSyncConfig, mut record: Record) -> Record {
    let mut coerced = Record::new();
    for column in &table.columns {
        let value = record.remove(&column.name).unwrap_or(Value::Null);
        coerced.insert(column.name.clone(), coerce_value(column.kind, value));
    }
    coerced
}
