// `notelens login`: store the access key and enable automatic sync.

use anyhow::{anyhow, Result};
use chrono::Utc;

use notelens_daemon::settings::{settings_path, SettingsHandle};

pub async fn run(access_key: String) -> Result<()> {
    let path = settings_path().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let settings = SettingsHandle::open(path);

    settings.update(|s| {
        s.access_token = access_key;
        s.auto_sync = true;
        // Seed the checkpoint so the first listen only catches up from now.
        let now = Utc::now();
        s.last_synced_time = now;
        s.sync_timestamp = now;
    })?;

    println!("Logged in. Automatic sync is enabled.");
    Ok(())
}
