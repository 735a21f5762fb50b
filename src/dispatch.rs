// ABOUTME: Work queue between the notification listener and the sync pipeline
// ABOUTME: Unbounded intake so receiving never blocks, bounded concurrency for syncs

use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::notification::ChangeNotification;
use crate::pipeline::SyncPipeline;
use crate::stats::StatsTracker;

/// Hands decoded changes to the pipeline.
///
/// `submit` only enqueues. A single dispatcher task admits queued changes
/// once a concurrency permit is free and runs each on its own task, so one
/// slow mirror write never holds up other rows or the listener. Queue depth
/// is reported through the pipeline's StatsTracker.
pub struct Dispatcher {
    intake: mpsc::UnboundedSender<ChangeNotification>,
    stats: Arc<StatsTracker>,
    task: JoinHandle<()>,
}

impl Dispatcher {
    pub fn spawn(pipeline: Arc<SyncPipeline>, max_concurrency: usize) -> Self {
        let (intake, mut receiver) = mpsc::unbounded_channel::<ChangeNotification>();
        let stats = Arc::clone(pipeline.stats());
        let permits = max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let queue_depth = Arc::clone(&stats);
        let task = tokio::spawn(async move {
            while let Some(change) = receiver.recv().await {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                queue_depth.record_dequeued();

                let pipeline = Arc::clone(&pipeline);
                tokio::spawn(async move {
                    pipeline.process(&change).await;
                    drop(permit);
                });
            }

            // Intake closed: wait for every in-flight sync to release its permit
            if let Ok(all) = semaphore.acquire_many(permits as u32).await {
                drop(all);
            }
            tracing::debug!("Dispatcher drained");
        });

        Self {
            intake,
            stats,
            task,
        }
    }

    /// Enqueue a change without waiting. Returns false once the dispatcher has stopped.
    pub fn submit(&self, change: ChangeNotification) -> bool {
        self.stats.record_queued();
        if let Err(rejected) = self.intake.send(change) {
            self.stats.record_dequeued();
            tracing::error!("Dispatcher stopped, dropping {}", rejected.0);
            return false;
        }
        true
    }

    /// Stop accepting changes and wait for queued and in-flight syncs.
    pub async fn shutdown(self) {
        drop(self.intake);
        if let Err(e) = self.task.await {
            tracing::error!("Dispatcher task failed: {}", e);
        }
    }
}
