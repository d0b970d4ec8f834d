// Wire messages for the notelens-feed.v1 realtime protocol.
//
// One authenticated channel per user identity carries row-level change
// events for the `notebooks` and `notes` tables plus the `note-content`
// broadcast topic with in-progress generation text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{NoteId, NotebookId};

/// All frame types in the notelens-feed.v1 protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// Client -> Server: authenticate and join the user's channel.
    Join { token: String, channel: String },

    /// Server -> Client: channel join acknowledgement.
    JoinAck { server_time: String },

    /// Server -> Client: a row changed in the `notebooks` table.
    NotebookChange { kind: ChangeKind, row: NotebookRow },

    /// Server -> Client: a row changed in the `notes` table.
    NoteChange { kind: ChangeKind, row: NoteRow },

    /// Server -> Client: broadcast with in-progress note content.
    NoteContent { frame: NoteContentFrame },

    /// Bidirectional keepalive.
    Heartbeat,

    /// Server -> Client: channel error.
    Error { code: String, message: String },
}

/// Row-level change kind, mirroring the service's table events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A `notebooks` table row as delivered by the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotebookRow {
    pub id: NotebookId,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Null until the notebook has rendered its first note; such notebooks
    /// have no document to download yet.
    #[serde(default)]
    pub note_orders: Option<Vec<NoteId>>,
    /// Origin tag of the client that authored the change, when known.
    #[serde(default)]
    pub source: Option<String>,
}

/// A `notes` table row as delivered by the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteRow {
    pub id: NoteId,
    pub notebook_id: NotebookId,
    #[serde(default)]
    pub image: Option<NoteImage>,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub source: Option<String>,
}

/// Source image attached to a note.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteImage {
    /// Storage path, resolved to a public URL for download.
    pub path: String,
    /// Display name used when rendering the note block.
    pub name: String,
}

/// Broadcast payload carrying the rendered note content so far.
///
/// `content` is cumulative: each frame supersedes the previous one for the
/// same note, and the final frame sets `end`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteContentFrame {
    pub note_id: NoteId,
    pub notebook_id: NotebookId,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub end: bool,
}
