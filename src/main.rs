// ABOUTME: CLI entry point for lake-replicator
// ABOUTME: Parses commands, wires the configured source and store, and routes to the orchestrator

use anyhow::Context;
use clap::{Parser, Subcommand};
use lake_replicator::config::{ReplicatorConfig, DEFAULT_CONFIG_PATH};
use lake_replicator::source::{ChangeFeedQuery, PostgresSource};
use lake_replicator::sync::{
    FullLoadMode, FullLoadOutcome, IncrementalSpec, SyncOrchestrator, SyncStats,
};
use lake_replicator::table::TargetTableRef;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "lake-replicator")]
#[command(about = "Relational-to-data-lake ingestion CLI", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured full and incremental load
    Run {
        /// Keep running, one cycle every sync.interval_secs, until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Copy one source table into the lake
    FullLoad {
        #[arg(long)]
        source_table: String,
        #[arg(long)]
        container: String,
        #[arg(long)]
        target_path: String,
        #[arg(long, value_enum, default_value_t = FullLoadMode::Overwrite)]
        mode: FullLoadMode,
    },
    /// Merge a table's change feed into its lake copy
    IncrementalLoad {
        #[arg(long)]
        source_table: String,
        #[arg(long)]
        container: String,
        #[arg(long)]
        target_path: String,
        #[arg(long)]
        changes_table: String,
        #[arg(long)]
        change_created_column: String,
        #[arg(long)]
        primary_key: String,
        #[arg(long)]
        deleted_column: String,
    },
    /// Print every stored watermark
    Watermarks,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = ReplicatorConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run { watch } => {
            let plan = config.plan();
            if plan.is_empty() {
                anyhow::bail!(
                    "No [[full_load]] or [[incremental]] entries in {}",
                    cli.config.display()
                );
            }
            let orchestrator = build_orchestrator(&config).await?;

            if watch {
                let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Received Ctrl-C, shutting down after the current step");
                        let _ = shutdown_tx.send(());
                    }
                });
                let cycles = orchestrator
                    .run_watch(&plan, config.sync_interval(), shutdown_rx)
                    .await;
                tracing::info!("Stopped after {} completed cycles", cycles);
                Ok(())
            } else {
                let stats = orchestrator.run_plan(&plan).await;
                report(&stats)
            }
        }
        Commands::FullLoad {
            source_table,
            container,
            target_path,
            mode,
        } => {
            let orchestrator = build_orchestrator(&config).await?;
            let target = TargetTableRef::new(container, &target_path);
            let outcome = orchestrator
                .full_load(&source_table, &target, mode)
                .await
                .with_context(|| format!("Full load of {} into {} failed", source_table, target))?;
            match outcome {
                FullLoadOutcome::Skipped => println!("{} already exists, nothing to do", target),
                FullLoadOutcome::Loaded { rows } => println!("Loaded {} rows into {}", rows, target),
            }
            Ok(())
        }
        Commands::IncrementalLoad {
            source_table,
            container,
            target_path,
            changes_table,
            change_created_column,
            primary_key,
            deleted_column,
        } => {
            let orchestrator = build_orchestrator(&config).await?;
            let spec = IncrementalSpec::new(
                source_table,
                TargetTableRef::new(container, &target_path),
                ChangeFeedQuery::new(changes_table, change_created_column),
                primary_key,
                deleted_column,
            );
            let outcome = orchestrator
                .incremental_load(&spec)
                .await
                .with_context(|| format!("Incremental load of {} failed", spec.target))?;
            println!(
                "{}: {} changes since {} ({} updated, {} inserted, {} deleted, {} skipped), watermark now {}",
                spec.target,
                outcome.changes_fetched,
                outcome.since,
                outcome.stats.updated,
                outcome.stats.inserted,
                outcome.stats.deleted,
                outcome.stats.skipped_deleted,
                outcome.advanced_to
            );
            Ok(())
        }
        Commands::Watermarks => {
            let store = config.build_store()?;
            let mut watermarks = config.watermark_store(store);
            let entries = watermarks
                .load()
                .await
                .with_context(|| format!("Failed to read watermarks from {}", watermarks.location()))?;
            if entries.is_empty() {
                println!("No watermarks stored at {}", watermarks.location());
            }
            for (path, watermark) in entries {
                println!("{}\t{}", path, watermark);
            }
            Ok(())
        }
    }
}

async fn build_orchestrator(config: &ReplicatorConfig) -> anyhow::Result<SyncOrchestrator> {
    let store = config.build_store()?;
    let retry = config.retry_policy();
    let source = PostgresSource::connect(&config.source_url()?, retry)
        .await
        .context("Failed to connect to source database")?;
    let watermarks = config.watermark_store(store.clone());
    Ok(SyncOrchestrator::new(Arc::new(source), store, watermarks, retry))
}

fn report(stats: &SyncStats) -> anyhow::Result<()> {
    println!(
        "Synced {} tables ({} skipped): {} rows loaded, {} inserted, {} updated, {} deleted in {}ms",
        stats.tables_synced,
        stats.tables_skipped,
        stats.rows_loaded,
        stats.rows_inserted,
        stats.rows_updated,
        stats.rows_deleted,
        stats.duration_ms
    );
    if stats.is_success() {
        return Ok(());
    }
    for error in &stats.errors {
        eprintln!("  {}", error);
    }
    anyhow::bail!("{} tables failed to sync", stats.errors.len())
}
