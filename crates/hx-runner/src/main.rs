//! # hx-runner
//!
//! Entry point for the agent-wallet strategy engine.
//!
//! Loads a JSON configuration file, registers the configured agent wallets,
//! starts the engine (which restores the last snapshot and boots the
//! configured strategies) and runs until Ctrl+C.
//!
//! Only the paper exchange ships with this build, so the runner trades on
//! testnet and drives the paper price stream itself.
//!
//! # Usage
//!
//! ```bash
//! hx-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use hx_core::config::load_config;
use hx_core::types::Network;
use hx_engine::{Engine, EngineContext, JsonFileStore, MemoryStore, StateStore};
use hx_td::{AgentRegistry, PaperExchange};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Testnet,
    Mainnet,
}

impl From<NetworkArg> for Network {
    fn from(n: NetworkArg) -> Self {
        match n {
            NetworkArg::Testnet => Network::Testnet,
            NetworkArg::Mainnet => Network::Mainnet,
        }
    }
}

/// Agent-wallet strategy engine runner.
#[derive(Parser)]
#[command(name = "hx-runner", about = "Agent-wallet strategy execution engine")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output. Overrides the config.
    #[arg(long)]
    log_dir: Option<String>,

    /// Override the configured network.
    #[arg(long, value_enum)]
    network: Option<NetworkArg>,

    /// Starting equity credited to every user owner on the paper exchange.
    #[arg(long, default_value_t = 100_000.0)]
    paper_equity: f64,

    /// Starting price of every paper symbol.
    #[arg(long, default_value_t = 100.0)]
    paper_price: f64,

    /// Period of the paper price driver in milliseconds.
    #[arg(long, default_value_t = 250)]
    paper_tick_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration, apply CLI overrides
    let mut cfg = load_config(&cli.config)?;
    if let Some(network) = cli.network {
        cfg.network = network.into();
    }
    if cli.log_dir.is_some() {
        cfg.logging.log_dir = cli.log_dir.clone();
    }

    // 2. Initialize logging. The guard flushes the file writer on drop.
    let _log_guard = hx_core::logging::init_logging(&cli.log_level, &cfg.logging);
    info!(
        "hx-runner starting: config={}, network={}, log_level={}",
        cli.config.display(),
        cfg.network,
        cli.log_level,
    );

    if cfg.network == Network::Mainnet {
        bail!("mainnet needs a wire exchange client, this build only ships the paper exchange");
    }

    // 3. Agents and state store
    let agents = Arc::new(AgentRegistry::from_config(&cfg.agents)?);
    info!("{} agent wallet(s) registered", agents.owners().len());

    let store: Arc<dyn StateStore> = match cfg.state_path.as_deref() {
        Some(path) => {
            info!("persisting engine state to {path}");
            Arc::new(JsonFileStore::new(path))
        }
        None => Arc::new(MemoryStore::new()),
    };

    // 4. Paper exchange
    let paper = Arc::new(PaperExchange::new());
    for owner in agents.owners() {
        if owner.vault_id().is_none() {
            paper.set_equity(&owner, cli.paper_equity);
        }
    }

    // 5. Engine
    let engine = Arc::new(Engine::start(EngineContext::single(cfg, Arc::clone(&paper), agents).with_store(store)).await?);

    let (stop_tx, stop_rx) = watch::channel(false);
    let driver = tokio::spawn(drive_paper_prices(
        paper,
        Arc::clone(&engine),
        cli.paper_price,
        Duration::from_millis(cli.paper_tick_ms.max(1)),
        stop_rx,
    ));

    info!("engine running, press Ctrl+C to stop");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    let _ = stop_tx.send(true);
    if let Err(e) = driver.await {
        error!("price driver task failed: {e}");
    }
    engine.shutdown().await?;

    info!("engine stopped, goodbye");
    Ok(())
}

// ---------------------------------------------------------------------------
// Paper price driver
// ---------------------------------------------------------------------------

/// Publish a slow oscillation around `base` for every symbol the engine's
/// feed is subscribed to. Each symbol gets its own phase so the books do not
/// move in lockstep.
async fn drive_paper_prices(
    paper: Arc<PaperExchange>,
    engine: Arc<Engine>,
    base: f64,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut step: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.changed() => break,
        }
        for (i, symbol) in engine.feed_symbols().iter().enumerate() {
            let phase = step as f64 / 40.0 + i as f64 * 1.7;
            let price = base * (1.0 + 0.02 * phase.sin() + 0.005 * (phase * 3.1).sin());
            paper.push_price(symbol, price);
        }
        step += 1;
    }
}
