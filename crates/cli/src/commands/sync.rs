// `notelens sync`: one reconciliation pass with progress output.

use std::sync::Arc;

use anyhow::{anyhow, Result};

use notelens_daemon::runtime::build_context;
use notelens_daemon::settings::{settings_path, SettingsHandle};
use notelens_daemon::sync::{refetch, ProgressSink};

pub async fn run() -> Result<()> {
    let path = settings_path().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let settings = Arc::new(SettingsHandle::open(path));

    let progress: ProgressSink = Arc::new(|line: &str| println!("{line}"));
    let ctx = build_context(&settings, progress)?;

    let checkpoint = refetch(&ctx).await?;
    println!("Last synced at {}", checkpoint.last_synced_time.to_rfc3339());
    Ok(())
}
