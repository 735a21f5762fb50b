// ABOUTME: CLI entry point for mirror-sync
// ABOUTME: Parses commands and runs the listener, one-shot syncs, or registry listing

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mirror_sync::bulk::{BulkSyncReport, DEFAULT_BATCH_SIZE, DEFAULT_MANUAL_LIMIT};
use mirror_sync::config::DEFAULT_MAX_CONCURRENCY;
use mirror_sync::{MirrorTarget, SyncWorker, TableRegistry, WorkerConfig};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "mirror-sync")]
#[command(about = "Mirror PostgreSQL tables to a secondary store from change notifications", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to a tables.toml registry (defaults to ~/.mirror-sync/tables.toml, then built-in tables)
    #[arg(long = "tables", env = "MIRROR_SYNC_TABLES", global = true)]
    tables: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    /// Primary PostgreSQL connection string
    #[arg(long, env = "SOURCE_DATABASE_URL", hide_env_values = true)]
    source: String,
    /// Mirror URL: https://... for a REST mirror, postgresql://... for a database mirror
    #[arg(long = "mirror-url", env = "MIRROR_URL", hide_env_values = true)]
    mirror_url: String,
    /// API key for REST mirrors
    #[arg(long = "mirror-key", env = "MIRROR_API_KEY", hide_env_values = true)]
    mirror_key: Option<String>,
}

#[derive(Args, Clone)]
struct TuningArgs {
    /// Rows per mirror upsert request
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Attempts per change before giving up
    #[arg(long, default_value_t = 3)]
    max_attempts: u32,
    /// Base retry delay in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_base_ms: u64,
    /// Maximum retry delay in milliseconds
    #[arg(long, default_value_t = 10_000)]
    retry_max_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for change notifications and mirror each changed row until Ctrl+C
    Listen {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Maximum number of rows synced concurrently
        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
        max_concurrency: usize,
        /// Apply changes to the same row one at a time
        #[arg(long)]
        serialize_per_key: bool,
        /// Copy every table in full before listening
        #[arg(long)]
        backfill: bool,
        /// Seconds between health status log lines (0 disables)
        #[arg(long, default_value_t = 60)]
        status_interval: u64,
    },
    /// Copy rows from the primary to the mirror once and exit
    Sync {
        #[command(flatten)]
        connection: ConnectionArgs,
        #[command(flatten)]
        tuning: TuningArgs,
        /// Sync a single table (default: every registered table)
        #[arg(long)]
        table: Option<String>,
        /// Maximum rows per table
        #[arg(long, default_value_t = DEFAULT_MANUAL_LIMIT, conflicts_with = "full")]
        limit: usize,
        /// Copy entire tables, paginating until exhausted
        #[arg(long)]
        full: bool,
    },
    /// Print the effective table registry
    Tables,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    mirror_sync::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Listen {
            connection,
            tuning,
            max_concurrency,
            serialize_per_key,
            backfill,
            status_interval,
        } => {
            let mut config = build_config(&connection, &tuning, cli.tables)?;
            config.max_concurrency = max_concurrency;
            config.serialize_per_key = serialize_per_key;
            config.validate()?;
            listen(config, backfill, status_interval).await
        }
        Commands::Sync {
            connection,
            tuning,
            table,
            limit,
            full,
        } => {
            let config = build_config(&connection, &tuning, cli.tables)?;
            let worker = SyncWorker::connect(config)?;
            let report = if full {
                worker.backfill(table.as_deref()).await?
            } else {
                worker.manual_sync(table.as_deref(), Some(limit)).await?
            };
            print_report(&report);
            if !report.is_success() {
                let failed_tables = report.tables.iter().filter(|t| !t.is_success()).count();
                anyhow::bail!("Sync finished with errors in {} table(s)", failed_tables);
            }
            Ok(())
        }
        Commands::Tables => {
            let registry = TableRegistry::resolve(cli.tables.as_deref())
                .context("Failed to load table registry")?;
            print_registry(&registry);
            Ok(())
        }
    }
}

fn build_config(
    connection: &ConnectionArgs,
    tuning: &TuningArgs,
    tables: Option<PathBuf>,
) -> anyhow::Result<WorkerConfig> {
    let mirror = MirrorTarget::parse(&connection.mirror_url, connection.mirror_key.as_deref())?;
    let mut config = WorkerConfig::new(&connection.source, mirror)?.with_registry_path(tables);
    config.batch_size = tuning.batch_size;
    config.retry.max_attempts = tuning.max_attempts;
    config.retry.base_delay = Duration::from_millis(tuning.retry_base_ms);
    config.retry.max_delay = Duration::from_millis(tuning.retry_max_ms);
    config.validate()?;
    Ok(config)
}

async fn listen(config: WorkerConfig, backfill: bool, status_interval: u64) -> anyhow::Result<()> {
    let worker = SyncWorker::connect(config)?;

    if backfill {
        tracing::info!("Running full backfill before listening...");
        let report = worker.backfill(None).await?;
        print_report(&report);
    }

    worker.start().await?;

    println!();
    println!("========================================");
    println!("Mirroring changes");
    println!("========================================");
    println!("  Tables: {}", worker.registry().table_names().join(", "));
    println!("  Press Ctrl+C to stop");
    println!();

    let mut status_ticker = (status_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(status_interval)));
    if let Some(ticker) = status_ticker.as_mut() {
        ticker.tick().await;
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = async {
                match status_ticker.as_mut() {
                    Some(ticker) => { ticker.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                tracing::info!("Health: {}", worker.health_status());
            }
        }
    }

    worker.stop().await?;

    let health = worker.health_status();
    println!();
    println!("========================================");
    println!("Mirror sync stopped");
    println!("========================================");
    println!("  Rows synced: {}", health.sync_count);
    println!("  Errors: {}", health.error_count);
    println!("  Success rate: {:.2}%", health.success_rate_percent);
    Ok(())
}

fn print_report(report: &BulkSyncReport) {
    println!();
    println!("========================================");
    println!("Sync complete");
    println!("========================================");
    for table in &report.tables {
        println!(
            "  {}: {} read, {} written, {}/{} batches failed",
            table.table,
            table.rows_read,
            table.rows_written,
            table.batches_failed,
            table.batches_attempted
        );
        for error in &table.errors {
            println!("    - {}", error);
        }
    }
    println!("  Duration: {}ms", report.duration_ms);
}

fn print_registry(registry: &TableRegistry) {
    for table in registry.tables() {
        println!("{}", table.qualified_name());
        println!("  channel: {}", table.channel);
        println!("  primary key: {}", table.primary_key);
        if table.mirror_table() != table.table_name {
            println!("  mirror table: {}", table.mirror_table());
        }
        let columns: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} ({})", c.name, c.kind.as_str()))
            .collect();
        println!("  columns: {}", columns.join(", "));
    }
}
