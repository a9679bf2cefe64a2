//! Ledger node
//!
//! Opens the ledger under the configured data directory, sweeps expired
//! mempool entries on a timer and, when a miner address is set, mines on it
//! until Ctrl-C.
//!
//! Usage: `ledger-node [config.toml]`

use std::sync::Arc;

use ledger_core::chain::{Ledger, LedgerOptions};
use ledger_core::config::NodeConfig;
use ledger_core::metrics::RecorderMetrics;
use ledger_core::mining::Miner;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::load(&path)?,
        None => NodeConfig::default(),
    };
    let miner_address = config.miner_address.clone();

    let options = LedgerOptions {
        metrics: Arc::new(RecorderMetrics),
        ..LedgerOptions::default()
    };
    let ledger = Arc::new(Ledger::open_with(config, options)?);
    info!(
        event = "node started",
        height = ledger.height(),
        tip = %ledger.tip_hash(),
        genesis = %ledger.genesis().hash()
    );

    let miner = miner_address.map(Miner::new);
    let mining = miner.clone().map(|miner| {
        let ledger = Arc::clone(&ledger);
        tokio::task::spawn_blocking(move || miner.run(&ledger))
    });
    if mining.is_none() {
        info!(event = "mining disabled", reason = "no miner_address configured");
    }

    let sweeper = {
        let ledger = Arc::clone(&ledger);
        let period = ledger.config().mempool.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                ledger.prune_mempool();
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!(event = "shutting down");
    sweeper.abort();

    if let (Some(miner), Some(handle)) = (miner, mining) {
        miner.stop();
        match handle.await {
            Ok(Ok(mined)) => info!(event = "miner stopped", mined),
            Ok(Err(e)) => error!(event = "miner failed", error = %e),
            Err(e) => error!(event = "miner task panicked", error = %e),
        }
    }

    match ledger.save_snapshot() {
        Ok(Some(path)) => info!(event = "final snapshot", path = %path.display()),
        Ok(None) => {}
        Err(e) => warn!(event = "final snapshot failed", error = %e),
    }
    Ok(())
}
