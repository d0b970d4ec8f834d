// notelensd: standalone sync daemon entry point.

use anyhow::Context;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    info!("starting notelens sync daemon");
    notelens_daemon::runtime::run_daemon()
        .await
        .context("sync daemon terminated unexpectedly")
}
