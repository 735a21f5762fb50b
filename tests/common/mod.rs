// ABOUTME: In-memory RecordSource and MirrorWriter used by the integration tests
// ABOUTME: Record every mirror call and allow failures to be injected by call index

#![allow(dead_code)]

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use mirror_sync::mirror::MirrorWriter;
use mirror_sync::registry::{TableRegistry, TableSyncConfig};
use mirror_sync::retry::{Permanent, RetryPolicy};
use mirror_sync::source::{Record, RecordSource};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

pub fn key_of(record: &Record, primary_key: &str) -> String {
    match record.get(primary_key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => panic!("record has no {} column", primary_key),
    }
}

pub fn registry() -> Arc<TableRegistry> {
    Arc::new(TableRegistry::builtin())
}

/// Millisecond delays so retry tests stay fast.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
}

/// Primary store held in memory, ordered by insertion per table.
#[derive(Default)]
pub struct FakeSource {
    tables: Mutex<HashMap<String, Vec<Record>>>,
    fail_reads: AtomicU32,
    fail_page_offsets: Mutex<HashSet<u64>>,
    invalid_keys: Mutex<HashSet<String>>,
    record_fetches: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, table: &str, row: Value) {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(record(row));
    }

    /// Insert `count` rows keyed 1..=count.
    pub fn seed_conversations(&self, count: u64) {
        for id in 1..=count {
            self.insert(
                "conversations",
                json!({
                    "id": id,
                    "user_id": "u1",
                    "user_message": format!("message {}", id),
                    "topics": "[\"greeting\"]",
                }),
            );
        }
    }

    pub fn remove(&self, table: &str, primary_key: &str, key: &str) {
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.retain(|r| key_of(r, primary_key) != key);
        }
    }

    /// Fail the next `n` reads of either kind.
    pub fn fail_next_reads(&self, n: u32) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    /// Fail every page read starting at `offset`.
    pub fn fail_page_at(&self, offset: u64) {
        self.fail_page_offsets.lock().unwrap().insert(offset);
    }

    /// Reject `key` the way the database rejects a key that does not cast
    /// to the primary-key type.
    pub fn reject_key(&self, key: &str) {
        self.invalid_keys.lock().unwrap().insert(key.to_string());
    }

    pub fn record_fetches(&self) -> usize {
        self.record_fetches.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RecordSource for FakeSource {
    async fn fetch_record(&self, table: &TableSyncConfig, key: &str) -> Result<Option<Record>> {
        self.record_fetches.fetch_add(1, Ordering::SeqCst);
        if self.invalid_keys.lock().unwrap().contains(key) {
            return Err(anyhow!("invalid input syntax for type bigint: \"{}\"", key))
                .context(Permanent);
        }
        if self.take_failure() {
            bail!("connection reset by peer");
        }
        let tables = self.tables.lock().unwrap();
        Ok(tables.get(&table.table_name).and_then(|rows| {
            rows.iter()
                .find(|r| key_of(r, &table.primary_key) == key)
                .cloned()
        }))
    }

    async fn fetch_page(
        &self,
        table: &TableSyncConfig,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>> {
        if self.take_failure() || self.fail_page_offsets.lock().unwrap().contains(&offset) {
            bail!("statement timeout");
        }
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(&table.table_name)
            .map(|rows| {
                rows.iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Mirror store held in memory, keyed by table then primary key.
#[derive(Default)]
pub struct FakeMirror {
    rows: Mutex<HashMap<String, BTreeMap<String, Record>>>,
    upsert_calls: Mutex<Vec<usize>>,
    delete_calls: Mutex<Vec<String>>,
    fail_upsert_calls: Mutex<HashSet<usize>>,
    fail_writes: AtomicU32,
}

impl FakeMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the upsert call with zero-based index `call`.
    pub fn fail_upsert_call(&self, call: usize) {
        self.fail_upsert_calls.lock().unwrap().insert(call);
    }

    /// Fail the next `n` writes of either kind.
    pub fn fail_next_writes(&self, n: u32) {
        self.fail_writes.store(n, Ordering::SeqCst);
    }

    pub fn put(&self, table: &str, key: &str, row: Value) {
        self.rows
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key.to_string(), record(row));
    }

    pub fn row(&self, table: &str, key: &str) -> Option<Record> {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .and_then(|rows| rows.get(key).cloned())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows
            .lock()
            .unwrap()
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }

    /// Batch size of every upsert call, failed ones included.
    pub fn upsert_calls(&self) -> Vec<usize> {
        self.upsert_calls.lock().unwrap().clone()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.upsert_calls.lock().unwrap().len() + self.delete_calls.lock().unwrap().len()
    }

    fn take_failure(&self) -> bool {
        self.fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MirrorWriter for FakeMirror {
    async fn upsert(&self, table: &TableSyncConfig, records: &[Record]) -> Result<()> {
        let call = {
            let mut calls = self.upsert_calls.lock().unwrap();
            calls.push(records.len());
            calls.len() - 1
        };
        if self.fail_upsert_calls.lock().unwrap().contains(&call) || self.take_failure() {
            bail!("mirror returned 503 Service Unavailable");
        }

        let mut rows = self.rows.lock().unwrap();
        let table_rows = rows.entry(table.mirror_table().to_string()).or_default();
        for row in records {
            table_rows.insert(key_of(row, &table.primary_key), row.clone());
        }
        Ok(())
    }

    async fn delete(&self, table: &TableSyncConfig, key: &str) -> Result<()> {
        self.delete_calls.lock().unwrap().push(key.to_string());
        if self.take_failure() {
            bail!("mirror returned 503 Service Unavailable");
        }
        if let Some(rows) = self.rows.lock().unwrap().get_mut(table.mirror_table()) {
            rows.remove(key);
        }
        Ok(())
    }
}
