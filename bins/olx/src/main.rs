//! OpenLedger service binary
//!
//! Provides commands for initializing and validating configuration and for
//! starting a service instance: the in-memory event store, the replay loop
//! with its saga listeners, the deposit watcher, and the command
//! dispatcher, all tied to one shutdown token. A fatal integrity error in
//! the replay loop cancels the token and the process exits non-zero.

mod dispatcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::{generate_default_config, load_config, save_config, validate_config};
use event_log::{EventLog, InMemoryEventStore, VersionControl};
use observability::{init_logging, LogFormat};
use projections::{Projections, ReplayLoop};
use trading::{OrderCommandPlanner, StopOrderTrigger};
use wallet::{DepositWatcher, LedgerSagaValidator, ProviderRegistry, WalletSagaCoordinator};

use crate::dispatcher::{CommandDispatcher, LogAnswerSink, LogDeadLetterSink};

#[derive(Debug, Parser)]
#[command(name = "olx", about = "OpenLedger exchange backend", version)]
struct Cli {
    /// Log output format
    #[arg(long, default_value = "pretty", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a service instance
    Start {
        /// Path to the configuration file
        #[arg(long, default_value = "olx.yaml")]
        config: PathBuf,
    },
    /// Validate a configuration file and print the report
    Validate {
        #[arg(long, default_value = "olx.yaml")]
        config: PathBuf,
    },
    /// Write a starter configuration file
    Init {
        #[arg(long, default_value = "olx.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging("olx", cli.log_format)?;

    match cli.command {
        Commands::Start { config } => start(&config).await,
        Commands::Validate { config } => validate(&config),
        Commands::Init { output } => init(&output),
    }
}

async fn start(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let report = validate_config(&config);
    for warning in &report.warnings {
        warn!(field = %warning.field, "{}", warning.message);
    }
    if !report.is_valid() {
        for err in &report.errors {
            error!("{err}");
        }
        anyhow::bail!("cannot start: configuration is invalid");
    }

    info!(exchange = %config.exchange.name, "starting OpenLedger");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                shutdown.cancel();
            }
        });
    }

    // Single durable truth: the event log. Everything below is derived.
    let store = Arc::new(InMemoryEventStore::new());
    let version = Arc::new(VersionControl::new(0));
    let log = Arc::new(EventLog::new(store, version));
    let projections = Projections::with_cas_attempts(config.engine.cas_attempts);

    let planner = Arc::new(
        OrderCommandPlanner::new(log.clone(), projections.clone())
            .with_max_attempts(config.engine.persist_attempts),
    );

    // Provider implementations are deployment-specific and registered by
    // the embedding service; a bare start runs with an empty registry.
    let registry = Arc::new(ProviderRegistry::new());
    for coin in config.wallet.coins.iter().filter(|c| c.enabled) {
        if registry.get(&coin.symbol.as_str().into()).is_err() {
            warn!(coin = %coin.symbol, "no wallet provider compiled in for coin");
        }
    }

    let saga = Arc::new(
        WalletSagaCoordinator::new(log.clone(), projections.clone(), registry.clone())
            .with_polling(
                Duration::from_secs(config.wallet.poll_interval_secs),
                config.wallet.validation_polls,
            ),
    );

    let dispatcher = Arc::new(
        CommandDispatcher::new(
            planner.clone(),
            saga,
            Arc::new(LogAnswerSink),
            Arc::new(LogDeadLetterSink),
        )
        .with_shutdown(shutdown.clone()),
    );
    info!(
        "command dispatcher ready: {} queue transport attaches here",
        dispatcher.describe()
    );

    let replay = Arc::new(
        ReplayLoop::new(log.clone(), projections.clone(), shutdown.clone())
            .with_tick(Duration::from_secs(config.engine.replay_tick_secs))
            .with_listener(Arc::new(LedgerSagaValidator::new(
                log.clone(),
                projections.clone(),
                planner.clone(),
            )))
            .with_listener(Arc::new(StopOrderTrigger::new(
                planner.clone(),
                projections.clone(),
            ))),
    );

    let watcher = Arc::new(
        DepositWatcher::new(
            log.clone(),
            projections.clone(),
            registry.clone(),
            shutdown.clone(),
        )
        .with_tick(Duration::from_secs(config.wallet.watch_tick_secs)),
    );

    let replay_task = tokio::spawn({
        let replay = replay.clone();
        async move { replay.run().await }
    });
    let watcher_task = tokio::spawn({
        let watcher = watcher.clone();
        async move { watcher.run().await }
    });

    shutdown.cancelled().await;
    watcher_task.await.ok();
    match replay_task.await {
        Ok(Ok(())) => {
            info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("replay loop halted on integrity violation"),
        Err(e) => Err(e).context("replay task panicked"),
    }
}

fn validate(config_path: &Path) -> Result<()> {
    let config = load_config(config_path)?;
    let report = validate_config(&config);

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] {warning}");
        }
    }
    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {err}");
        }
        anyhow::bail!("configuration validation failed");
    }

    println!("[ok] Configuration is valid");
    println!("Exchange: {}", config.exchange.name);
    println!("Version:  {}", config.exchange.version);
    println!(
        "Coins:    {}",
        config
            .wallet
            .coins
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.symbol.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn init(output_path: &Path) -> Result<()> {
    let config = generate_default_config();
    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {parent:?}"))?;
        }
    }
    save_config(&config, output_path)?;
    println!("[ok] Configuration written to {output_path:?}");
    println!("Next: olx validate --config {output_path:?}");
    Ok(())
}
