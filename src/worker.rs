// ABOUTME: SyncWorker - the operator surface tying listener, pipeline, bulk syncer and stats together
// ABOUTME: Provides start/stop, manual and full-table sync, and the health snapshot

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::bulk::{BulkSyncReport, BulkSyncer, DEFAULT_MANUAL_LIMIT};
use crate::config::WorkerConfig;
use crate::dispatch::Dispatcher;
use crate::listener::{ListenerConfig, NotificationListener};
use crate::mirror::{open_mirror, MirrorWriter};
use crate::pipeline::SyncPipeline;
use crate::postgres::PgRecordSource;
use crate::registry::TableRegistry;
use crate::source::RecordSource;
use crate::stats::{HealthStatus, StatsTracker};
use crate::utils::redact_url;

struct Running {
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

/// One change-data-capture worker.
///
/// Stats live on the worker, so two workers in one process never share
/// counters.
pub struct SyncWorker {
    registry: Arc<TableRegistry>,
    source_url: String,
    pipeline: Arc<SyncPipeline>,
    bulk: BulkSyncer,
    stats: Arc<StatsTracker>,
    listener_config: ListenerConfig,
    max_concurrency: usize,
    running: Arc<AtomicBool>,
    state: Mutex<Option<Running>>,
}

impl SyncWorker {
    /// Build a worker against the configured primary and mirror.
    ///
    /// No connection is opened here; the listener connects on `start` and
    /// the fetcher and mirror connect on first use.
    pub fn connect(config: WorkerConfig) -> Result<Self> {
        config.validate()?;

        let registry = TableRegistry::resolve(config.registry_path.as_deref())
            .context("Failed to load table registry")?;
        let source: Arc<dyn RecordSource> = Arc::new(PgRecordSource::new(config.source_url.clone()));
        let mirror = open_mirror(&config.mirror)?;

        tracing::info!(
            "Configured sync from {} to {} mirror {} ({} tables)",
            redact_url(&config.source_url),
            config.mirror.kind(),
            redact_url(config.mirror.url()),
            registry.len()
        );

        Ok(Self::new(Arc::new(registry), source, mirror, &config))
    }

    /// Build a worker from explicit collaborators.
    pub fn new(
        registry: Arc<TableRegistry>,
        source: Arc<dyn RecordSource>,
        mirror: Arc<dyn MirrorWriter>,
        config: &WorkerConfig,
    ) -> Self {
        let stats = Arc::new(StatsTracker::new());

        let mut pipeline = SyncPipeline::new(
            Arc::clone(&registry),
            Arc::clone(&source),
            Arc::clone(&mirror),
            config.retry,
            Arc::clone(&stats),
        );
        if config.serialize_per_key {
            pipeline = pipeline.with_key_serialization();
        }

        let bulk = BulkSyncer::new(
            Arc::clone(&registry),
            source,
            mirror,
            Arc::clone(&stats),
            config.batch_size,
        );

        Self {
            registry,
            source_url: config.source_url.clone(),
            pipeline: Arc::new(pipeline),
            bulk,
            stats,
            listener_config: config.listener.clone(),
            max_concurrency: config.max_concurrency,
            running: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(None),
        }
    }

    /// Start listening for changes. Calling this on a running worker does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if self.is_running() {
            tracing::info!("Sync worker already running");
            return Ok(());
        }
        // A listener that exited on its own leaves a finished task behind
        if let Some(stale) = state.take() {
            let _ = stale.task.await;
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let dispatcher = Dispatcher::spawn(Arc::clone(&self.pipeline), self.max_concurrency);
        let listener = NotificationListener::new(
            self.source_url.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.stats),
            self.listener_config.clone(),
        );

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            if let Err(e) = listener.run(&dispatcher, shutdown_rx).await {
                tracing::error!("Notification listener stopped: {:#}", e);
            }
            running.store(false, Ordering::SeqCst);
            dispatcher.shutdown().await;
            tracing::info!("Sync worker stopped");
        });

        *state = Some(Running { shutdown, task });
        tracing::info!(
            "Sync worker started for tables: {}",
            self.registry.table_names().join(", ")
        );
        Ok(())
    }

    /// Stop listening and wait for in-flight syncs to finish.
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.state.lock().await.take() else {
            return Ok(());
        };

        let start = Instant::now();
        // Send fails only if the listener already exited
        let _ = running.shutdown.send(());
        running
            .task
            .await
            .context("Sync worker task panicked during shutdown")?;
        self.running.store(false, Ordering::SeqCst);

        tracing::info!(
            "Sync worker shut down in {}ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bounded bulk sync of one table, or of every table when `table_name`
    /// is `None`. `limit` defaults to 100 rows per table.
    pub async fn manual_sync(
        &self,
        table_name: Option<&str>,
        limit: Option<usize>,
    ) -> Result<BulkSyncReport> {
        let limit = limit.unwrap_or(DEFAULT_MANUAL_LIMIT);
        match table_name {
            Some(name) => {
                let start = Instant::now();
                let summary = self.bulk.sync_table(name, limit).await?;
                Ok(BulkSyncReport {
                    tables: vec![summary],
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            None => Ok(self.bulk.sync_all(limit).await),
        }
    }

    /// Copy entire tables into the mirror, paginating until each is exhausted.
    pub async fn backfill(&self, table_name: Option<&str>) -> Result<BulkSyncReport> {
        match table_name {
            Some(name) => {
                let start = Instant::now();
                let summary = self.bulk.backfill_table(name).await?;
                Ok(BulkSyncReport {
                    tables: vec![summary],
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            None => Ok(self.bulk.backfill_all().await),
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        self.stats
            .snapshot(self.is_running(), self.registry.table_names())
    }

    pub fn registry(&self) -> &TableRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }
}
