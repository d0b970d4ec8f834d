// `notelens status`: account info and sync bookkeeping.

use anyhow::{anyhow, Result};

use notelens_daemon::service::{ApiConfig, HttpApi, RemoteApi};
use notelens_daemon::settings::{settings_path, SettingsHandle};

pub async fn run() -> Result<()> {
    let path = settings_path().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let settings = SettingsHandle::open(path);
    let snapshot = settings.snapshot();

    if snapshot.access_token.is_empty() {
        println!("Not logged in. Run `notelens login <access-key>` first.");
        return Ok(());
    }

    let checkpoint = snapshot.checkpoint();
    if checkpoint.is_fresh() {
        println!("Never synced.");
    } else {
        println!("Last synced: {}", checkpoint.last_synced_time.to_rfc3339());
    }
    println!("Auto sync: {}", if snapshot.auto_sync { "on" } else { "off" });
    println!("Sync folder: {}", snapshot.sync_path);

    let mut config = ApiConfig::new(snapshot.access_token.clone());
    if let Some(url) = &snapshot.service_url {
        config = config.with_base_url(url.clone());
    }
    let api = HttpApi::new(config);
    match api.account_info().await {
        Ok(info) => {
            if let Some(email) = info.email {
                println!("Account: {email}");
            }
            if let Some(plan) = info.plan {
                println!("Plan: {plan}");
            }
            if let (Some(used), Some(limit)) = (info.notes_used, info.notes_limit) {
                println!("Notes: {used}/{limit}");
            }
        }
        Err(error) => println!("Could not fetch account info: {error}"),
    }
    Ok(())
}
