//! Kline Sync Service
//!
//! Keeps an exchange's spot symbol list and OHLCV candle history in sync
//! with TimescaleDB.
//!
//! ## Commands
//! - `symbols`: reconcile stored symbols with the exchange listing
//! - `klines`: backfill and forward-fill every active pair
//! - `run`: both, once
//! - `daemon`: both on intervals, with a health check endpoint

use clap::{Parser, Subcommand, ValueEnum};
use kline_sync::clock::{Clock, SystemClock};
use kline_sync::config::Config;
use kline_sync::errors::Result;
use kline_sync::exchange::ExchangeClient;
use kline_sync::health::{self, HealthState};
use kline_sync::pipeline::{Orchestrator, RunMode, RunState, RunSummary};
use kline_sync::store::{CandleStore, MemoryStore, PostgresStore};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "kline-sync", version, about = "Sync exchange symbols and candles into TimescaleDB")]
struct Cli {
    /// TOML config file (environment variables are used when absent)
    #[arg(short, long, env = "KLINE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured exchange
    #[arg(long)]
    exchange: Option<String>,

    /// Where candles are written
    #[arg(long, value_enum, default_value_t = StoreKind::Postgres)]
    store: StoreKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Sync symbol metadata once
    Symbols,
    /// Sync candles for stored active symbols once
    Klines,
    /// Sync symbols, then candles, once
    Run,
    /// Keep syncing on intervals until SIGTERM
    Daemon,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum StoreKind {
    Postgres,
    /// In-process store, nothing persists
    Memory,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.log_level);

    match execute(cli.command, cli.store, config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Startup failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    if let Some(exchange) = &cli.exchange {
        config.pipeline.exchange_id = exchange.to_lowercase();
        config.validate()?;
    }
    Ok(config)
}

/// Initialize tracing subscriber. RUST_LOG wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Returns whether the command succeeded.
async fn execute(command: Command, store_kind: StoreKind, config: Config) -> Result<bool> {
    info!("Starting kline sync ({:?})", command);
    info!("  Exchange: {}", config.pipeline.exchange_id);
    info!(
        "  Timeframes: {}",
        config
            .timeframes()
            .iter()
            .map(|tf| tf.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    info!("  Seed: {}", config.pipeline.seed_timestamp);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let client = Arc::new(ExchangeClient::from_config(&config, clock.clone())?);
    let store = open_store(store_kind, &config).await?;
    let orchestrator = Orchestrator::new(config.pipeline.clone(), client, store.clone(), clock);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown().await;
            info!("Shutdown signal received, finishing in-flight writes...");
            cancel.cancel();
        }
    });

    let mode = match command {
        Command::Symbols => RunMode::Symbols,
        Command::Klines => RunMode::Klines,
        Command::Run => RunMode::Full,
        Command::Daemon => {
            run_daemon(&config, &orchestrator, store, &cancel).await;
            return Ok(true);
        }
    };

    let summary = orchestrator.run(mode, &cancel).await;
    report(&summary);
    Ok(summary.is_success())
}

async fn open_store(kind: StoreKind, config: &Config) -> Result<Arc<dyn CandleStore>> {
    match kind {
        StoreKind::Postgres => {
            info!(
                "Connecting to database {}:{}/{}...",
                config.database.host, config.database.port, config.database.name
            );
            let store = PostgresStore::connect(&config.database).await?;
            info!("Database connection established");
            Ok(Arc::new(store))
        }
        StoreKind::Memory => {
            warn!("Using in-memory store, nothing will be persisted");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn report(summary: &RunSummary) {
    for outcome in summary.pairs.iter().filter(|p| p.is_failed()) {
        warn!("{}: {:?}", outcome.pair, outcome.status);
    }
    match serde_json::to_string_pretty(summary) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to render run summary: {}", e),
    }
}

/// Symbol and kline syncs on their own intervals until cancelled.
async fn run_daemon(
    config: &Config,
    orchestrator: &Orchestrator,
    store: Arc<dyn CandleStore>,
    cancel: &CancellationToken,
) {
    let klines_every = Duration::from_secs(config.daemon.klines_interval_secs.max(1));
    let health_state = HealthState::new(klines_every * 3);
    health_state.set_db_connected(store.ping().await);

    let port = config.daemon.health_check_port;
    let health_handle = tokio::spawn({
        let state = health_state.clone();
        async move {
            if let Err(e) = health::run_health_server(port, state).await {
                error!("Health server error: {}", e);
            }
        }
    });

    let mut symbols_tick = tokio::time::interval(Duration::from_secs(config.daemon.symbols_interval_secs.max(1)));
    let mut klines_tick = tokio::time::interval(klines_every);
    symbols_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    klines_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!("Daemon started, waiting for shutdown signal...");

    // Symbols tick first so the initial kline run sees a fresh symbol set
    loop {
        let mode = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = symbols_tick.tick() => RunMode::Symbols,
            _ = klines_tick.tick() => RunMode::Klines,
        };

        health_state.set_run_state(match mode {
            RunMode::Symbols => RunState::SyncingSymbols,
            _ => RunState::ProcessingPairs,
        });
        let summary = orchestrator.run(mode, cancel).await;
        health_state.record_run(&summary);
        health_state.set_db_connected(store.ping().await);

        if !summary.is_success() {
            warn!(
                "{:?} run finished with state {} and {} failed pairs",
                mode,
                summary.state,
                summary.failed()
            );
        }
    }

    health_handle.abort();
    info!("Kline sync daemon stopped");
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
