// ABOUTME: NotificationListener - owns the LISTEN connection to the primary database
// ABOUTME: Subscribes to every table channel, forwards changes, and reconnects with backoff

use anyhow::{anyhow, bail, Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_postgres::{AsyncMessage, Client};

use crate::dispatch::Dispatcher;
use crate::notification::{route, RawNotification};
use crate::postgres::connection::make_tls_connector;
use crate::registry::TableRegistry;
use crate::retry::RetryPolicy;
use crate::stats::StatsTracker;
use crate::utils::{quote_ident, redact_url};

/// Configuration for the NotificationListener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Backoff between reconnect attempts
    pub reconnect: RetryPolicy,
    /// Interval between liveness queries on the subscription connection
    pub heartbeat_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy::reconnect(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// Keeps one dedicated subscription connection to the primary.
///
/// Each session:
/// 1. Connects and drives the connection on its own task
/// 2. Issues `LISTEN` once per distinct channel
/// 3. Routes every notification to the dispatcher without waiting on syncs
/// 4. Pings the server each heartbeat interval while still draining
///    notifications; a ping left unanswered for a full interval ends the session
///
/// When a session ends for any reason other than shutdown, the error is
/// counted and a new session is started after a backoff delay. Changes
/// committed while disconnected are not replayed.
pub struct NotificationListener {
    source_url: String,
    registry: Arc<TableRegistry>,
    stats: Arc<StatsTracker>,
    config: ListenerConfig,
}

impl NotificationListener {
    pub fn new(
        source_url: String,
        registry: Arc<TableRegistry>,
        stats: Arc<StatsTracker>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            source_url,
            registry,
            stats,
            config,
        }
    }

    /// Run sessions until a shutdown signal arrives or reconnects are exhausted.
    pub async fn run(
        &self,
        dispatcher: &Dispatcher,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let mut failures = 0u32;
        let mut sessions = 0u64;

        tracing::info!(
            "Starting notification listener on {} for {} tables",
            redact_url(&self.source_url),
            self.registry.len()
        );

        loop {
            sessions += 1;
            let mut subscribed = false;

            let result = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping notification listener");
                    return Ok(());
                }
                result = self.session(dispatcher, &mut subscribed) => result,
            };

            let error = match result {
                Ok(()) => anyhow!("notification connection closed"),
                Err(e) => e,
            };

            if subscribed {
                failures = 0;
                tracing::warn!(
                    "Changes committed while disconnected are not replayed; run a manual sync to repair the mirror"
                );
            }

            self.stats
                .record_connection_error(format!("notification connection lost: {:#}", error));

            failures = failures.saturating_add(1);
            if failures >= self.config.reconnect.max_attempts {
                return Err(error.context(format!(
                    "Notification listener gave up after {} consecutive failures",
                    failures
                )));
            }

            let delay = self.config.reconnect.delay_for(failures - 1);
            tracing::error!(
                "Notification session {} ended: {:#}. Reconnecting in {:?}",
                sessions,
                error,
                delay
            );

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received during reconnect backoff");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection lifetime. Only returns when the connection is unusable.
    async fn session(&self, dispatcher: &Dispatcher, subscribed: &mut bool) -> Result<()> {
        let (client, mut notifications, driver) = self.open().await?;
        let client = Arc::new(client);
        let mut in_flight: Option<JoinHandle<Result<()>>> = None;

        let result: Result<()> = async {
            subscribe(&client, &self.registry.channels()).await?;
            *subscribed = true;
            tracing::info!(
                "Listening on {} channels",
                self.registry.channels().len()
            );

            let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    raw = notifications.recv() => match raw {
                        Some(raw) => {
                            forward(&self.registry, &self.stats, dispatcher, &raw);
                        }
                        None => return Ok(()),
                    },
                    _ = heartbeat.tick(), if in_flight.is_none() => {
                        in_flight = Some(tokio::spawn(ping(
                            Arc::clone(&client),
                            self.config.heartbeat_interval,
                        )));
                    }
                    result = heartbeat_result(&mut in_flight) => {
                        result?;
                        tracing::trace!("Notification connection heartbeat ok");
                    }
                }
            }
        }
        .await;

        if let Some(handle) = in_flight.take() {
            handle.abort();
        }

        match result {
            Ok(()) => match driver.await {
                Ok(Ok(())) => bail!("Notification connection closed by server"),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow!("Notification connection task failed: {}", e)),
            },
            Err(e) => {
                driver.abort();
                Err(e)
            }
        }
    }

    /// Connect and spawn the task that polls the connection, forwarding
    /// notifications into a channel.
    async fn open(
        &self,
    ) -> Result<(
        Client,
        mpsc::UnboundedReceiver<RawNotification>,
        JoinHandle<Result<()>>,
    )> {
        let tls = make_tls_connector()?;
        let (client, mut connection) = tokio_postgres::connect(&self.source_url, tls)
            .await
            .with_context(|| {
                format!(
                    "Failed to open notification connection to {}",
                    redact_url(&self.source_url)
                )
            })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message.context("Notification connection failed")? {
                    AsyncMessage::Notification(n) => {
                        let raw = RawNotification::new(n.channel(), n.payload());
                        if sender.send(raw).is_err() {
                            break;
                        }
                    }
                    AsyncMessage::Notice(notice) => {
                        tracing::info!("Server notice: {}", notice.message());
                    }
                    _ => {}
                }
            }
            Ok::<(), anyhow::Error>(())
        });

        Ok((client, receiver, driver))
    }
}

/// `LISTEN` on each channel. Channels are deduplicated by the registry, and
/// repeating `LISTEN` on a session is a no-op server side.
async fn subscribe(client: &Client, channels: &[&str]) -> Result<()> {
    for channel in channels {
        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .with_context(|| format!("Failed to subscribe to channel '{}'", channel))?;
        tracing::debug!("Subscribed to channel '{}'", channel);
    }
    Ok(())
}

/// Liveness query on the subscription connection. A server that does not
/// answer within `limit` counts as a dead connection.
async fn ping(client: Arc<Client>, limit: Duration) -> Result<()> {
    match tokio::time::timeout(limit, client.simple_query("SELECT 1")).await {
        Ok(result) => {
            result.context("Heartbeat on notification connection failed")?;
            Ok(())
        }
        Err(_) => bail!("Heartbeat on notification connection timed out after {:?}", limit),
    }
}

/// Resolve once the in-flight heartbeat finishes; pending while none is running.
async fn heartbeat_result(in_flight: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    let Some(handle) = in_flight.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *in_flight = None;
    joined.map_err(|e| anyhow!("Heartbeat task failed: {}", e))?
}

/// Route one raw notification to the dispatcher.
///
/// Returns whether it was accepted; rejected notifications are counted as
/// discarded and never reach the pipeline.
pub fn forward(
    registry: &TableRegistry,
    stats: &StatsTracker,
    dispatcher: &Dispatcher,
    raw: &RawNotification,
) -> bool {
    match route(registry, raw) {
        Some(change) => {
            tracing::debug!("Received {}", change);
            dispatcher.submit(change)
        }
        None => {
            stats.record_discarded();
            false
        }
    }
}
