// `notelens listen`: run the realtime listener in the foreground.

use anyhow::Result;

pub async fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    notelens_daemon::runtime::run_listener().await
}
