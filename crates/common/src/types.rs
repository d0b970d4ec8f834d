// Core domain types shared across all notelens crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a notebook on the remote service.
pub type NotebookId = i64;

/// Identifier of a note on the remote service.
pub type NoteId = i64;

/// Sync progress marker persisted between sessions.
///
/// `sync_timestamp` is the high-water mark used as the lower bound for the
/// next manifest fetch; `last_synced_time` is wall-clock bookkeeping for
/// display only. Wire and settings representation is epoch milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncCheckpoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_synced_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub sync_timestamp: DateTime<Utc>,
}

impl SyncCheckpoint {
    /// The never-synced checkpoint: both marks at the Unix epoch.
    pub fn epoch() -> Self {
        Self {
            last_synced_time: DateTime::<Utc>::UNIX_EPOCH,
            sync_timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// True when no sync has ever completed (high-water mark still at epoch).
    pub fn is_fresh(&self) -> bool {
        self.sync_timestamp.timestamp_millis() == 0
    }
}

impl Default for SyncCheckpoint {
    fn default() -> Self {
        Self::epoch()
    }
}
