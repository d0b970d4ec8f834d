// Incremental note assembly: placeholder substitution in a cached template.
//
// While the remote service streams a note's content, each broadcast frame
// carries the full rendered content so far. Assembly resolves the owning
// document by id suffix, fetches the note-scoped template exactly once,
// substitutes the note's placeholder token with the rendered block, and
// overwrites the whole file. Every write starts from the cached template,
// so replacements are idempotent and last-write-wins.
//
// Frames are serialized per note id; rapid chunks for one note never race
// on the same file, and intermediate frames may coalesce away entirely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{anyhow, Result};
use tracing::{debug, warn};

use notelens_common::naming::{notebook_suffix, placeholder_token};
use notelens_common::protocol::feed::NoteContentFrame;
use notelens_common::types::{NoteId, NotebookId};

use crate::serial::SerialQueue;
use crate::store::find_by_suffix;
use crate::sync::SyncContext;

/// Initial state registered when a note-with-image event arrives.
#[derive(Debug, Clone)]
pub struct BufferSeed {
    pub notebook_id: NotebookId,
    pub image_name: String,
    /// Image path relative to the sync root, as embedded in the document.
    pub image_rel_path: String,
}

/// Ephemeral per-note assembly state.
#[derive(Debug, Clone)]
struct NoteBuffer {
    notebook_id: NotebookId,
    image_name: String,
    image_rel_path: String,
    /// Note-scoped template, fetched once per note.
    template: Option<String>,
    /// Owning document file name, resolved once per note.
    resolved_file: Option<String>,
    last_version: u64,
}

struct AssemblerInner {
    ctx: Arc<SyncContext>,
    buffers: StdMutex<HashMap<NoteId, NoteBuffer>>,
}

/// Routes content frames into serialized per-note assembly work.
#[derive(Clone)]
pub struct Assembler {
    inner: Arc<AssemblerInner>,
    queue: SerialQueue<NoteId, NoteContentFrame>,
}

impl Assembler {
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let inner = Arc::new(AssemblerInner { ctx, buffers: StdMutex::new(HashMap::new()) });
        let queue = {
            let inner = Arc::clone(&inner);
            SerialQueue::new(move |note_id: NoteId, frame: NoteContentFrame| {
                let inner = Arc::clone(&inner);
                async move { apply_frame(inner, note_id, frame).await }
            })
        };
        Self { inner, queue }
    }

    /// Track a note for assembly. A second registration for the same note
    /// keeps the existing buffer (and its cached template).
    pub fn register(&self, note_id: NoteId, seed: BufferSeed) {
        self.inner
            .buffers
            .lock()
            .expect("assembler buffers lock poisoned")
            .entry(note_id)
            .or_insert(NoteBuffer {
                notebook_id: seed.notebook_id,
                image_name: seed.image_name,
                image_rel_path: seed.image_rel_path,
                template: None,
                resolved_file: None,
                last_version: 0,
            });
    }

    /// Queue a content frame; frames for untracked notes are dropped
    /// inside the serialized execution.
    pub fn submit(&self, frame: NoteContentFrame) {
        self.queue.submit(frame.note_id, frame);
    }

    /// Number of notes currently tracked for assembly.
    pub fn tracked_notes(&self) -> usize {
        self.inner.buffers.lock().expect("assembler buffers lock poisoned").len()
    }
}

/// The rendered note block substituted for the placeholder.
fn render_note_block(content: &str, image_name: &str, image_rel_path: &str) -> String {
    format!("![{image_name}]({image_rel_path})\n\n{content}")
}

async fn apply_frame(
    inner: Arc<AssemblerInner>,
    note_id: NoteId,
    frame: NoteContentFrame,
) -> Result<()> {
    let snapshot = {
        let buffers = inner.buffers.lock().expect("assembler buffers lock poisoned");
        match buffers.get(&note_id) {
            Some(buffer) => buffer.clone(),
            None => {
                debug!(note = note_id, "frame for untracked note, dropping");
                return Ok(());
            }
        }
    };
    if frame.version < snapshot.last_version {
        debug!(
            note = note_id,
            version = frame.version,
            seen = snapshot.last_version,
            "stale content frame, dropping"
        );
        return Ok(());
    }

    let ctx = &inner.ctx;

    // Resolve the owning document once; not materialized yet is benign.
    let file = match snapshot.resolved_file.clone() {
        Some(file) => file,
        None => {
            match find_by_suffix(
                ctx.store.as_ref(),
                &ctx.paths.root,
                &notebook_suffix(snapshot.notebook_id),
            )? {
                Some(file) => file,
                None => {
                    debug!(note = note_id, "owning document not materialized, dropping frame");
                    return Ok(());
                }
            }
        }
    };

    // Fetch the note-scoped template exactly once per note.
    let template = match snapshot.template.clone() {
        Some(template) => template,
        None => {
            let url = ctx.api.document_url(snapshot.notebook_id, Some(note_id));
            let bytes = ctx.api.fetch_bytes(&url, true).await?;
            String::from_utf8(bytes).map_err(|_| anyhow!("note template is not valid UTF-8"))?
        }
    };

    let token = placeholder_token(note_id);
    if !template.contains(&token) {
        warn!(note = note_id, "template is missing the placeholder token");
    }
    let block =
        render_note_block(&frame.content, &snapshot.image_name, &snapshot.image_rel_path);
    let content = template.replace(&token, &block);
    ctx.store.write(&ctx.paths.doc_path(&file), content.as_bytes())?;

    let mut buffers = inner.buffers.lock().expect("assembler buffers lock poisoned");
    if frame.end {
        // Final frame: drop the buffer so long sessions stay bounded.
        buffers.remove(&note_id);
    } else if let Some(buffer) = buffers.get_mut(&note_id) {
        buffer.resolved_file = Some(file);
        buffer.template = Some(template);
        buffer.last_version = frame.version;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testutil::{test_context, TestContext};

    use super::*;

    const TEMPLATE_URL: &str = "https://svc.test/download?id=42&note_id=7";

    fn frame(content: &str, version: u64, end: bool) -> NoteContentFrame {
        NoteContentFrame {
            note_id: 7,
            notebook_id: 42,
            content: content.to_string(),
            version,
            end,
        }
    }

    fn seed() -> BufferSeed {
        BufferSeed {
            notebook_id: 42,
            image_name: "shot.png".into(),
            image_rel_path: "images/shot.png".into(),
        }
    }

    fn template() -> String {
        format!("# Foo\n\nintro\n\n{}\n\nepilogue\n", placeholder_token(7))
    }

    fn expected(content: &str) -> String {
        template().replace(
            &placeholder_token(7),
            &render_note_block(content, "shot.png", "images/shot.png"),
        )
    }

    async fn wait_for_content(ctx: &crate::sync::SyncContext, expected: &str) {
        let deadline = tokio::time::Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                let current = ctx.store.read_to_string("notebooks/Foo-42.md").ok().flatten();
                if current.as_deref() == Some(expected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("document never reached expected content");
    }

    fn assembler_over_materialized_doc() -> (TestContext, Assembler) {
        let tc = test_context();
        tc.ctx.store.write("notebooks/Foo-42.md", template().as_bytes()).unwrap();
        tc.api.add_body(TEMPLATE_URL, template().as_bytes());
        let assembler = Assembler::new(Arc::clone(&tc.ctx));
        (tc, assembler)
    }

    #[tokio::test]
    async fn untracked_note_frame_is_a_no_op() {
        let (tc, assembler) = assembler_over_materialized_doc();

        assembler.submit(frame("ignored", 1, false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(tc.api.request_count(), 0);
        assert_eq!(
            tc.ctx.store.read_to_string("notebooks/Foo-42.md").unwrap(),
            Some(template())
        );
    }

    #[tokio::test]
    async fn unmaterialized_document_drops_the_frame() {
        let tc = test_context();
        tc.api.add_body(TEMPLATE_URL, template().as_bytes());
        let assembler = Assembler::new(Arc::clone(&tc.ctx));

        assembler.register(7, seed());
        assembler.submit(frame("text", 1, false));
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No document to splice into: no template fetch either.
        assert_eq!(tc.api.request_count(), 0);
    }

    #[tokio::test]
    async fn template_is_fetched_once_across_frames() {
        let (tc, assembler) = assembler_over_materialized_doc();
        assembler.register(7, seed());

        assembler.submit(frame("", 0, false));
        wait_for_content(&tc.ctx, &expected("")).await;

        assembler.submit(frame("first", 1, false));
        wait_for_content(&tc.ctx, &expected("first")).await;

        assembler.submit(frame("first\nsecond", 2, false));
        wait_for_content(&tc.ctx, &expected("first\nsecond")).await;

        assert_eq!(tc.api.requests_for(TEMPLATE_URL), 1);
    }

    #[tokio::test]
    async fn final_content_matches_writing_last_frame_alone() {
        let (tc, assembler) = assembler_over_materialized_doc();
        assembler.register(7, seed());

        for (version, content) in
            [(1, "alpha"), (2, "alpha\nbeta"), (3, "alpha\nbeta\ngamma")]
        {
            assembler.submit(frame(content, version, false));
            wait_for_content(&tc.ctx, &expected(content)).await;
        }

        // A second assembler fed only the final frame converges to the
        // same bytes.
        let (tc2, assembler2) = assembler_over_materialized_doc();
        assembler2.register(7, seed());
        assembler2.submit(frame("alpha\nbeta\ngamma", 3, false));
        wait_for_content(&tc2.ctx, &expected("alpha\nbeta\ngamma")).await;

        assert_eq!(
            tc.ctx.store.read_to_string("notebooks/Foo-42.md").unwrap(),
            tc2.ctx.store.read_to_string("notebooks/Foo-42.md").unwrap(),
        );
    }

    #[tokio::test]
    async fn stale_versions_are_dropped() {
        let (tc, assembler) = assembler_over_materialized_doc();
        assembler.register(7, seed());

        assembler.submit(frame("newer", 5, false));
        wait_for_content(&tc.ctx, &expected("newer")).await;

        assembler.submit(frame("older", 2, false));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            tc.ctx.store.read_to_string("notebooks/Foo-42.md").unwrap(),
            Some(expected("newer"))
        );
    }

    #[tokio::test]
    async fn end_frame_writes_then_evicts_the_buffer() {
        let (tc, assembler) = assembler_over_materialized_doc();
        assembler.register(7, seed());
        assert_eq!(assembler.tracked_notes(), 1);

        assembler.submit(frame("done", 9, true));
        wait_for_content(&tc.ctx, &expected("done")).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while assembler.tracked_notes() != 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("buffer should evict after the end frame");
    }

    #[tokio::test]
    async fn duplicate_registration_keeps_existing_buffer() {
        let (tc, assembler) = assembler_over_materialized_doc();
        assembler.register(7, seed());

        assembler.submit(frame("text", 1, false));
        wait_for_content(&tc.ctx, &expected("text")).await;

        // Re-registration must not reset the cached template.
        assembler.register(7, seed());
        assembler.submit(frame("more", 2, false));
        wait_for_content(&tc.ctx, &expected("more")).await;

        assert_eq!(tc.api.requests_for(TEMPLATE_URL), 1);
    }
}
