// Filename conventions for synced notebook documents.
//
// A notebook materializes as `<title>-<id>.md` in the sync folder. Titles
// can change remotely, so most flows locate the file by the `-<id>.md`
// suffix alone. A download that does not know the current title uses the
// draft sentinel name `!-<id>.md` as its destination; materialization
// resolves it to whatever file currently carries the suffix.

use crate::types::{NoteId, NotebookId};

/// Suffix shared by every materialization of notebook `id`.
pub fn notebook_suffix(id: NotebookId) -> String {
    format!("-{id}.md")
}

/// Canonical file name for a notebook whose title is known.
pub fn notebook_file_name(title: &str, id: NotebookId) -> String {
    format!("{title}-{id}.md")
}

/// Sentinel destination for a download that must resolve the real file
/// by suffix (the current title is unknown to the caller).
pub fn draft_file_name(id: NotebookId) -> String {
    format!("!-{id}.md")
}

/// Placeholder token substituted during incremental note assembly.
pub fn placeholder_token(note_id: NoteId) -> String {
    format!("<!-- place-holder-note-{note_id} -->")
}

/// Last path segment of a URL or storage path, ignoring query and fragment.
/// Returns `None` when the segment would be empty.
pub fn last_url_segment(url: &str) -> Option<&str> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let segment = trimmed.rsplit('/').next()?;
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}
