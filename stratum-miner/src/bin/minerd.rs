//! Main entry point for the stratum-miner daemon.

use stratum_miner::{config::MinerConfig, daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = MinerConfig::from_env()?;
    let daemon = Daemon::new(config);
    daemon.run().await
}
