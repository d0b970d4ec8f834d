// Manifest types for the bulk reconciliation pass.
//
// The remote service answers `GET /api/plugin/manifest?since=<ms>` with a
// snapshot of everything that changed after the given timestamp. Consumed
// once per pass, never cached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Everything that changed on the remote since a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Server-side high-water mark for this snapshot; becomes the next
    /// checkpoint's `sync_timestamp`.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_updated: DateTime<Utc>,
    pub file_list: FileList,
}

/// Changed files, split by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileList {
    /// Immutable binary assets (images), addressed by URL; the destination
    /// filename is the URL's last path segment.
    #[serde(default)]
    pub assets: Vec<String>,
    /// Rendered notebook documents; always re-fetched.
    #[serde(default)]
    pub markdowns: Vec<MarkdownEntry>,
}

/// One rendered notebook document in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MarkdownEntry {
    pub url: String,
    /// Destination file name, `<title>-<id>.md`.
    pub name: String,
}
