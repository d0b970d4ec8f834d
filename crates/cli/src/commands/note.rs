// `notelens note`: generate a note from an image and stream it to stdout.

use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use notelens_daemon::service::{ApiConfig, HttpApi, NoteSource, RemoteApi};
use notelens_daemon::settings::{settings_path, SettingsHandle};
use notelens_daemon::store::{FsStore, LocalStore};

pub async fn run(image: PathBuf) -> Result<()> {
    let path = settings_path().ok_or_else(|| anyhow!("could not determine home directory"))?;
    let settings = SettingsHandle::open(path);
    let snapshot = settings.snapshot();
    if snapshot.access_token.is_empty() {
        anyhow::bail!("not logged in: run `notelens login <access-key>` first");
    }

    let bytes = std::fs::read(&image)
        .with_context(|| format!("failed to read image {}", image.display()))?;
    let filename = image
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("image path has no usable filename"))?
        .to_string();

    // Keep a copy in the vault's image folder, like an editor-side capture.
    if let Some(vault) = &snapshot.vault_path {
        let store = FsStore::new(vault);
        let dest = format!("{}/{filename}", snapshot.image_path);
        if !store.exists(&dest) {
            store.write(&dest, &bytes)?;
        }
    }

    let mut config = ApiConfig::new(snapshot.access_token.clone());
    if let Some(url) = &snapshot.service_url {
        config = config.with_base_url(url.clone());
    }
    let api = HttpApi::new(config);

    let mut stdout = std::io::stdout();
    api.generate_note(NoteSource::File { bytes, filename }, &mut |chunk: &str| {
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    })
    .await?;
    println!();
    Ok(())
}
