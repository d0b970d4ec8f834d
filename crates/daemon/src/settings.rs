// Persisted settings at `~/.notelens/settings.toml`.
//
// Loaded merged with defaults at startup and written back after every
// checkpoint advance or setting change. The checkpoint pair inside the
// settings is the only durable state the sync core owns.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use notelens_common::types::SyncCheckpoint;

/// Root directory for notelens global state: `~/.notelens/`.
pub fn global_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".notelens"))
}

/// Path to the settings file: `~/.notelens/settings.toml`.
pub fn settings_path() -> Option<PathBuf> {
    global_dir().map(|d| d.join("settings.toml"))
}

/// Everything the host persists between sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Access key for the remote service; empty until login.
    pub access_token: String,
    /// Root folder of the local vault the store writes into.
    pub vault_path: Option<String>,
    /// Vault-relative folder for locally captured images.
    pub image_path: String,
    /// Vault-relative folder that synced notebooks land in.
    pub sync_path: String,
    /// Start the realtime listener automatically.
    pub auto_sync: bool,
    /// Service base URL override (testing and self-hosting).
    pub service_url: Option<String>,
    /// Realtime feed URL override.
    pub feed_url: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_synced_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sync_timestamp: DateTime<Utc>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            vault_path: None,
            image_path: "assets".into(),
            sync_path: "notebooks".into(),
            auto_sync: false,
            service_url: None,
            feed_url: None,
            last_synced_time: DateTime::<Utc>::UNIX_EPOCH,
            sync_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Settings {
    /// Load from the default location. Missing or unparseable files fall
    /// back to defaults.
    pub fn load() -> Self {
        settings_path().and_then(|p| Self::load_from(&p).ok()).unwrap_or_default()
    }

    /// Load from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let contents = std::fs::read_to_string(path).map_err(SettingsError::Io)?;
        toml::from_str(&contents).map_err(SettingsError::Parse)
    }

    /// Save to a specific path (creates parent directories).
    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(SettingsError::Io)?;
        }
        let contents = toml::to_string_pretty(self).map_err(SettingsError::Serialize)?;
        std::fs::write(path, contents).map_err(SettingsError::Io)
    }

    pub fn checkpoint(&self) -> SyncCheckpoint {
        SyncCheckpoint {
            last_synced_time: self.last_synced_time,
            sync_timestamp: self.sync_timestamp,
        }
    }

    pub fn set_checkpoint(&mut self, checkpoint: SyncCheckpoint) {
        self.last_synced_time = checkpoint.last_synced_time;
        self.sync_timestamp = checkpoint.sync_timestamp;
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings I/O error: {0}")]
    Io(std::io::Error),
    #[error("settings parse error: {0}")]
    Parse(toml::de::Error),
    #[error("settings serialize error: {0}")]
    Serialize(toml::ser::Error),
}

// ── Shared handle ───────────────────────────────────────────────────

/// Where checkpoint advances are persisted.
pub trait CheckpointStore: Send + Sync {
    fn checkpoint(&self) -> SyncCheckpoint;
    fn advance(&self, checkpoint: SyncCheckpoint) -> Result<()>;
}

/// Settings state shared between the listener, the reconciler and the CLI.
/// Every mutation writes straight back to disk.
pub struct SettingsHandle {
    path: PathBuf,
    state: StdMutex<Settings>,
}

impl SettingsHandle {
    /// Open the handle at `path`, merging the file with defaults.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = Settings::load_from(&path).unwrap_or_default();
        Self { path, state: StdMutex::new(state) }
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> Settings {
        self.state.lock().expect("settings lock poisoned").clone()
    }

    /// Mutate the settings and persist the result.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) -> Result<()> {
        let mut state = self.state.lock().expect("settings lock poisoned");
        mutate(&mut state);
        state.save_to(&self.path)?;
        Ok(())
    }
}

impl CheckpointStore for SettingsHandle {
    fn checkpoint(&self) -> SyncCheckpoint {
        self.state.lock().expect("settings lock poisoned").checkpoint()
    }

    fn advance(&self, checkpoint: SyncCheckpoint) -> Result<()> {
        self.update(|settings| settings.set_checkpoint(checkpoint))
    }
}
