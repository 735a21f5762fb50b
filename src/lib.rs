// ABOUTME: Library root for mirror-sync
// ABOUTME: Mirrors PostgreSQL tables to a secondary store from LISTEN/NOTIFY change events

pub mod bulk;
pub mod coercer;
pub mod config;
pub mod dispatch;
pub mod listener;
pub mod mirror;
pub mod notification;
pub mod pipeline;
pub mod postgres;
pub mod registry;
pub mod retry;
pub mod source;
pub mod stats;
pub mod utils;
pub mod worker;

pub use config::{MirrorTarget, WorkerConfig};
pub use registry::{TableRegistry, TableSyncConfig};
pub use worker::SyncWorker;
