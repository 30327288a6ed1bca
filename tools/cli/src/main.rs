//! offsync CLI - inspect and maintain an offline store.
//!
//! Diagnostics over the local database: record counts, exports, cleanup,
//! conflict review and resolution, and manual sync passes.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use offsync_remote::RestBackend;
use offsync_storage::{OfflineStore, ResolutionStrategy, SqliteStore, StoreConfig};
use offsync_sync::{ConnectivityMonitor, SyncEngine, SyncOutcome};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "offsync")]
#[command(about = "offsync - Offline store diagnostics")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: ./offsync.json if present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show record counts per family.
    Stats,

    /// Dump every record as JSON.
    Export {
        /// Output file (default: stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove expired cache entries and old finished records.
    Cleanup,

    /// Delete all data, keeping the client id.
    Clear {
        /// Skip the confirmation check.
        #[arg(long)]
        yes: bool,
    },

    /// List pending transactions and queue items.
    Pending,

    /// List unresolved conflicts.
    Conflicts,

    /// Resolve a conflict.
    Resolve {
        /// Conflict key.
        #[arg(short, long)]
        key: String,

        /// "client-wins", "server-wins", "merge", or "manual".
        #[arg(short, long)]
        strategy: String,

        /// Resolution payload as JSON (required for "manual").
        #[arg(long)]
        data: Option<String>,

        /// Queue the push instead of sending it now.
        #[arg(long)]
        offline: bool,
    },

    /// Run a sync pass against the configured backend.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = CliConfig::load(cli.config.as_deref())?;
    let db_path = config.database_path(cli.db.as_deref())?;

    match cli.command {
        Commands::Stats => cmd_stats(&config, &db_path).await,
        Commands::Export { output } => cmd_export(&config, &db_path, output.as_deref()).await,
        Commands::Cleanup => cmd_cleanup(&config, &db_path).await,
        Commands::Clear { yes } => cmd_clear(&config, &db_path, yes).await,
        Commands::Pending => cmd_pending(&config, &db_path).await,
        Commands::Conflicts => cmd_conflicts(&config, &db_path).await,
        Commands::Resolve {
            key,
            strategy,
            data,
            offline,
        } => cmd_resolve(&config, &db_path, &key, &strategy, data.as_deref(), offline).await,
        Commands::Sync => cmd_sync(&config, &db_path).await,
    }
}

/// Open the store, creating its directory.
async fn open_store(config: &CliConfig, path: &Path) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let store_config = StoreConfig::at_path(path).with_retention_days(config.store.retention_days);
    let store = SqliteStore::new(&store_config);
    store
        .initialize()
        .await
        .with_context(|| format!("Failed to open store {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Build a sync engine over the configured backend.
async fn open_engine(config: &CliConfig, path: &Path, online: bool) -> Result<SyncEngine> {
    let remote = config
        .remote
        .clone()
        .context("No remote configured; add a \"remote\" section to the config file")?;
    let backend = RestBackend::new(remote).context("Failed to create REST backend")?;
    let store = open_store(config, path).await?;

    Ok(SyncEngine::new(
        store,
        Arc::new(backend),
        Arc::new(ConnectivityMonitor::new(online)),
        config.sync.clone().with_auto_sync(false),
    ))
}

/// Show record counts.
async fn cmd_stats(config: &CliConfig, path: &Path) -> Result<()> {
    let store = open_store(config, path).await?;
    let stats = store.get_storage_stats().await?;
    let client_id = store.client_id().await?;

    println!("Offline store: {}", path.display());
    println!("  Client ID: {}", client_id.as_str());
    println!("  Transactions: {}", stats.transactions);
    println!("  Cached entries: {}", stats.cached_entries);
    println!("  Sync queue: {}", stats.sync_queue);
    println!("  Conflicts: {}", stats.conflicts);
    println!("  Size: {} bytes", stats.total_bytes);

    Ok(())
}

/// Dump the store as JSON.
async fn cmd_export(config: &CliConfig, path: &Path, output: Option<&Path>) -> Result<()> {
    let store = open_store(config, path).await?;
    let export = store.export_data().await?;
    let json = serde_json::to_string_pretty(&export)?;

    match output {
        Some(output) => {
            tokio::fs::write(output, json)
                .await
                .context("Failed to write export file")?;
            println!("Exported to {}", output.display());
        }
        None => println!("{}", json),
    }

    Ok(())
}

/// Run a cleanup pass.
async fn cmd_cleanup(config: &CliConfig, path: &Path) -> Result<()> {
    let store = open_store(config, path).await?;
    let report = store.cleanup_expired_data().await?;

    println!("Cleanup complete:");
    println!("  Expired cache entries: {}", report.expired_entries);
    println!("  Purged queue items: {}", report.purged_sync_items);
    println!("  Purged conflicts: {}", report.purged_conflicts);

    Ok(())
}

/// Delete every record.
async fn cmd_clear(config: &CliConfig, path: &Path, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to clear {} without --yes", path.display());
    }

    let store = open_store(config, path).await?;
    store.clear_all_data().await?;
    info!("Cleared offline store at {}", path.display());
    println!("Offline store cleared.");

    Ok(())
}

/// List outstanding work.
async fn cmd_pending(config: &CliConfig, path: &Path) -> Result<()> {
    let store = open_store(config, path).await?;
    let transactions = store.get_pending_transactions().await?;
    let items = store.get_next_sync_items(usize::MAX).await?;

    println!("Pending transactions: {}", transactions.len());
    for txn in &transactions {
        println!(
            "  #{} {} {} ({}, retries {}/{})",
            txn.id,
            txn.method.as_str(),
            txn.url,
            txn.entity_type,
            txn.retry_count,
            txn.max_retries
        );
    }

    println!("Pending queue items: {}", items.len());
    for item in &items {
        println!(
            "  #{} {} {}/{} (priority {}, retries {}/{})",
            item.id,
            item.operation,
            item.entity_type,
            item.entity_id.as_deref().unwrap_or("-"),
            item.priority,
            item.retry_count,
            item.max_retries
        );
    }

    Ok(())
}

/// List unresolved conflicts.
async fn cmd_conflicts(config: &CliConfig, path: &Path) -> Result<()> {
    let store = open_store(config, path).await?;
    let conflicts = store.get_unresolved_conflicts().await?;

    if conflicts.is_empty() {
        println!("No unresolved conflicts.");
        return Ok(());
    }

    for conflict in &conflicts {
        println!("{}", conflict.key);
        println!("  Entity: {}/{}", conflict.entity_type, conflict.entity_id);
        println!("  Detected: {}", conflict.timestamp);
        println!("  Client: {}", conflict.client_data);
        println!("  Server: {}", conflict.server_data);
    }

    Ok(())
}

/// Resolve one conflict.
async fn cmd_resolve(
    config: &CliConfig,
    path: &Path,
    key: &str,
    strategy: &str,
    data: Option<&str>,
    offline: bool,
) -> Result<()> {
    let strategy: ResolutionStrategy = strategy.parse()?;
    let resolution = data
        .map(serde_json::from_str::<Value>)
        .transpose()
        .context("Resolution data is not valid JSON")?;

    let engine = open_engine(config, path, !offline).await?;
    let entry = engine
        .resolve_conflict(key, strategy, resolution)
        .await
        .with_context(|| format!("Failed to resolve {}", key))?;

    println!("Resolved {} with {}", entry.key, entry.strategy);
    if let Some(resolution) = &entry.resolution {
        println!("  Result: {}", resolution);
    }

    Ok(())
}

/// Run one forced sync pass.
async fn cmd_sync(config: &CliConfig, path: &Path) -> Result<()> {
    let engine = open_engine(config, path, true).await?;
    let outcome = engine.force_sync().await.context("Sync failed")?;

    match outcome {
        SyncOutcome::Completed(summary) => {
            println!("Sync complete in {:?}:", summary.duration);
            println!("  Processed: {}", summary.total);
            println!("  Completed: {}", summary.completed);
            println!("  Failed: {}", summary.failed);
            println!("  Conflicts: {}", summary.conflicts);
            println!("  Deferred: {}", summary.deferred);
        }
        SyncOutcome::Skipped { reason } => println!("Sync skipped: {:?}", reason),
    }

    Ok(())
}
