// ABOUTME: In-process sync statistics and the health snapshot built from them
// ABOUTME: Owned by the worker and shared with the listener, pipeline, and bulk syncer

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::notification::ChangeOperation;

/// Result of attempting one change notification. Logged and counted, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub table_name: String,
    pub primary_key_value: String,
    pub operation: ChangeOperation,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Counters for one worker lifetime. Reset only by constructing a new tracker.
#[derive(Debug)]
pub struct StatsTracker {
    started_at: DateTime<Utc>,
    started: Instant,
    sync_count: AtomicU64,
    error_count: AtomicU64,
    connection_errors: AtomicU64,
    discarded: AtomicU64,
    queued: AtomicU64,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl Default for StatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsTracker {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            sync_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            queued: AtomicU64::new(0),
            last_sync_at: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn record(&self, outcome: &SyncOutcome) {
        if outcome.success {
            self.record_success(1);
        } else {
            let message = format!(
                "{} {}:{}: {}",
                outcome.operation,
                outcome.table_name,
                outcome.primary_key_value,
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            self.record_error(message);
        }
    }

    /// Count `rows` successful row syncs (one per notification, or a whole bulk batch).
    pub fn record_success(&self, rows: u64) {
        self.sync_count.fetch_add(rows, Ordering::Relaxed);
        if let Ok(mut last) = self.last_sync_at.lock() {
            *last = Some(Utc::now());
        }
    }

    pub fn record_error(&self, message: String) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.set_last_error(message);
    }

    /// The subscription connection failed; counted as an error as well.
    pub fn record_connection_error(&self, message: String) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
        self.record_error(message);
    }

    /// A notification was dropped before reaching the pipeline.
    pub fn record_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// A change entered the dispatch queue.
    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// A queued change was admitted to a worker slot or dropped.
    pub fn record_dequeued(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn connection_errors(&self) -> u64 {
        self.connection_errors.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Changes received but not yet admitted to a worker slot.
    pub fn queued_changes(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    fn set_last_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }

    pub fn snapshot(&self, is_running: bool, tables: Vec<String>) -> HealthStatus {
        let sync_count = self.sync_count();
        let error_count = self.error_count();

        HealthStatus {
            is_running,
            sync_count,
            error_count,
            success_rate_percent: success_rate(sync_count, error_count),
            last_sync_at: self.last_sync_at.lock().ok().and_then(|v| *v),
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            tables,
            connection_errors: self.connection_errors(),
            discarded_notifications: self.discarded(),
            queued_changes: self.queued_changes(),
            last_error: self.last_error.lock().ok().and_then(|v| v.clone()),
        }
    }
}

fn success_rate(successes: u64, errors: u64) -> f64 {
    let total = successes + errors;
    if total == 0 {
        return 100.0;
    }
    let rate = successes as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Read-only view of the worker's health.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub is_running: bool,
    pub sync_count: u64,
    pub error_count: u64,
    pub success_rate_percent: f64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub tables: Vec<String>,
    pub connection_errors: u64,
    pub discarded_notifications: u64,
    pub queued_changes: u64,
    pub last_error: Option<String>,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "running={} synced={} errors={} success={:.2}% queued={} uptime={}s last_sync={} tables=[{}]",
            self.is_running,
            self.sync_count,
            self.error_count,
            self.success_rate_percent,
            self.queued_changes,
            self.uptime_secs,
            self.last_sync_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
            self.tables.join(", ")
        )
    }
}
