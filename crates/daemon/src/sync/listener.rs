// Change-feed listener: routes realtime events into the sync engine.
//
// One authenticated channel per user identity delivers row changes for the
// `notebooks` and `notes` tables plus the `note-content` broadcast topic.
// Notebook work funnels through a per-notebook serializer so bursty events
// coalesce to a single re-download; note content goes to the assembler.
//
// The listener does not self-heal. On a status transition to `Subscribed`
// with a non-fresh checkpoint it triggers a catch-up reconciliation (the
// feed has no replay), and the supervisor owns restarts after drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use notelens_common::naming::{
    draft_file_name, last_url_segment, notebook_file_name, notebook_suffix,
};
use notelens_common::protocol::feed::{
    ChangeKind, NoteContentFrame, NoteImage, NoteRow, NotebookRow,
};
use notelens_common::types::{NotebookId, SyncCheckpoint};

use crate::assembler::{Assembler, BufferSeed};
use crate::retry::with_retry_if;
use crate::serial::SerialQueue;
use crate::service::RemoteApi;
use crate::store::find_by_suffix;

use super::{download_item, refetch, retryable, DownloadItem, SyncContext, EVENT_RETRY};

/// Hard bound on a single note-image fetch, distinct from retry.
const IMAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Last observed state of the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError,
}

/// Events surfaced by a feed transport.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Status(ChannelStatus),
    Notebook { kind: ChangeKind, row: NotebookRow },
    Note { kind: ChangeKind, row: NoteRow },
    Content(NoteContentFrame),
}

/// Abstraction over the realtime transport (WebSocket in production).
#[async_trait]
pub trait FeedTransport: Send {
    /// Authenticate and join the user's channel.
    async fn connect(&mut self, token: &str) -> Result<()>;

    /// Next event. `Ok(None)` on clean close.
    async fn next_event(&mut self) -> Result<Option<FeedEvent>>;

    /// Sever the subscription.
    async fn close(&mut self);
}

/// Work item for the per-notebook serializer.
#[derive(Debug, Clone)]
struct NotebookTask {
    /// Current title when the event carried one; `None` resolves the
    /// destination by id suffix.
    title: Option<String>,
    updated_at: chrono::DateTime<Utc>,
}

struct ListenerShared {
    ctx: Arc<SyncContext>,
    status: StdMutex<ChannelStatus>,
    refetch_in_flight: AtomicBool,
}

impl ListenerShared {
    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().expect("listener status lock poisoned") = status;
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock().expect("listener status lock poisoned")
    }

    /// Kick a catch-up reconciliation unless one is already running.
    fn spawn_refetch(self: &Arc<Self>) {
        if self
            .refetch_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("refetch already in flight, skipping");
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = refetch(&shared.ctx).await {
                warn!(%error, "catch-up sync failed");
            }
            shared.refetch_in_flight.store(false, Ordering::SeqCst);
        });
    }
}

/// Running listener. Dropping the handle tears the subscription down.
pub struct ListenerHandle {
    shared: Arc<ListenerShared>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Last observed connection state.
    pub fn last_status(&self) -> ChannelStatus {
        self.shared.status()
    }

    /// Manually trigger a full reconciliation from the current checkpoint.
    pub fn start_refetch(&self) {
        self.shared.spawn_refetch();
    }

    /// Sever the subscription. Operations already dispatched to the
    /// serializer or the downloader run to completion.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Stop and wait for the event loop to exit.
    pub async fn stopped(self) {
        self.stop();
        let _ = self.task.await;
    }
}

/// Open the feed and start routing events.
pub async fn start(
    ctx: Arc<SyncContext>,
    mut transport: Box<dyn FeedTransport>,
) -> Result<ListenerHandle> {
    let token =
        ctx.api.realtime_token().await.context("failed to fetch realtime token")?;
    transport.connect(&token).await.context("failed to open feed channel")?;

    let shared = Arc::new(ListenerShared {
        ctx: Arc::clone(&ctx),
        status: StdMutex::new(ChannelStatus::Subscribed),
        refetch_in_flight: AtomicBool::new(false),
    });

    let notebooks = {
        let ctx = Arc::clone(&ctx);
        SerialQueue::new(move |notebook_id: NotebookId, task: NotebookTask| {
            let ctx = Arc::clone(&ctx);
            async move { download_notebook(&ctx, notebook_id, task).await }
        })
    };
    let assembler = Assembler::new(Arc::clone(&ctx));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_loop(
        Arc::clone(&shared),
        transport,
        notebooks,
        assembler,
        shutdown_rx,
    ));

    info!("feed listener started");
    Ok(ListenerHandle { shared, shutdown: shutdown_tx, task })
}

async fn run_loop(
    shared: Arc<ListenerShared>,
    mut transport: Box<dyn FeedTransport>,
    notebooks: SerialQueue<NotebookId, NotebookTask>,
    assembler: Assembler,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            // Fires on stop() and when the handle is dropped.
            _ = shutdown.changed() => {
                transport.close().await;
                shared.set_status(ChannelStatus::Closed);
                debug!("feed listener stopped");
                break;
            }
            event = transport.next_event() => match event {
                Ok(Some(event)) => handle_event(&shared, &notebooks, &assembler, event),
                Ok(None) => {
                    debug!("feed channel closed by server");
                    shared.set_status(ChannelStatus::Closed);
                    break;
                }
                Err(error) => {
                    warn!(%error, "feed channel error");
                    shared.set_status(ChannelStatus::ChannelError);
                    break;
                }
            }
        }
    }
}

fn handle_event(
    shared: &Arc<ListenerShared>,
    notebooks: &SerialQueue<NotebookId, NotebookTask>,
    assembler: &Assembler,
    event: FeedEvent,
) {
    match event {
        FeedEvent::Status(status) => {
            debug!(?status, "feed status changed");
            shared.set_status(status);
            if status == ChannelStatus::Subscribed
                && !shared.ctx.checkpoints.checkpoint().is_fresh()
            {
                shared.spawn_refetch();
            }
        }
        FeedEvent::Notebook { kind, row } => handle_notebook(shared, notebooks, kind, row),
        FeedEvent::Note { kind, row } => handle_note(shared, notebooks, assembler, kind, row),
        FeedEvent::Content(frame) => assembler.submit(frame),
    }
}

fn handle_notebook(
    shared: &Arc<ListenerShared>,
    notebooks: &SerialQueue<NotebookId, NotebookTask>,
    kind: ChangeKind,
    row: NotebookRow,
) {
    if shared.ctx.is_loopback(row.source.as_deref()) {
        debug!(notebook = row.id, "ignoring locally originated notebook change");
        return;
    }
    if kind == ChangeKind::Delete {
        // Removal is mirrored on the soft-delete update, not the row purge.
        return;
    }
    if row.deleted_at.is_some() {
        if let Err(error) = remove_notebook(&shared.ctx, row.id) {
            warn!(notebook = row.id, %error, "failed to remove deleted notebook");
        }
        return;
    }
    if row.note_orders.is_none() {
        debug!(notebook = row.id, "notebook has no rendered document yet");
        return;
    }
    notebooks.submit(
        row.id,
        NotebookTask { title: Some(row.title), updated_at: row.updated_at },
    );
}

fn handle_note(
    shared: &Arc<ListenerShared>,
    notebooks: &SerialQueue<NotebookId, NotebookTask>,
    assembler: &Assembler,
    kind: ChangeKind,
    row: NoteRow,
) {
    if shared.ctx.is_loopback(row.source.as_deref()) {
        debug!(note = row.id, "ignoring locally originated note change");
        return;
    }
    match kind {
        ChangeKind::Insert => {
            // Content arrives over the broadcast topic; only the source
            // image needs fetching now.
            if let Some(image) = row.image.clone() {
                let ctx = Arc::clone(&shared.ctx);
                let assembler = assembler.clone();
                tokio::spawn(async move {
                    if let Err(error) = ingest_note_image(&ctx, &assembler, &row, &image).await
                    {
                        warn!(note = row.id, %error, "failed to ingest note image");
                    }
                });
            }
        }
        ChangeKind::Update => {
            // Note completion implies the owning notebook document changed.
            notebooks.submit(
                row.notebook_id,
                NotebookTask { title: None, updated_at: row.generated_at },
            );
        }
        ChangeKind::Delete => {}
    }
}

/// Re-download a notebook's rendered document and advance the checkpoint.
async fn download_notebook(
    ctx: &SyncContext,
    notebook_id: NotebookId,
    task: NotebookTask,
) -> Result<()> {
    let dest = match &task.title {
        Some(title) => ctx.paths.doc_path(&notebook_file_name(title, notebook_id)),
        None => ctx.paths.doc_path(&draft_file_name(notebook_id)),
    };
    let item = DownloadItem {
        url: ctx.api.document_url(notebook_id, None),
        dest,
        needs_auth: true,
    };
    with_retry_if(
        EVENT_RETRY,
        || download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item),
        retryable,
    )
    .await
    .with_context(|| format!("failed to download notebook {notebook_id}"))?;

    ctx.checkpoints.advance(SyncCheckpoint {
        last_synced_time: Utc::now(),
        sync_timestamp: task.updated_at,
    })
}

/// Delete the local file matching `-<id>.md`. Missing file is a no-op.
fn remove_notebook(ctx: &SyncContext, notebook_id: NotebookId) -> Result<()> {
    match find_by_suffix(ctx.store.as_ref(), &ctx.paths.root, &notebook_suffix(notebook_id))? {
        Some(name) => {
            info!(notebook = notebook_id, file = %name, "removing deleted notebook");
            ctx.store.delete(&ctx.paths.doc_path(&name))
        }
        None => Ok(()),
    }
}

/// Download a new note's image and prime the assembler for its content.
async fn ingest_note_image(
    ctx: &Arc<SyncContext>,
    assembler: &Assembler,
    row: &NoteRow,
    image: &NoteImage,
) -> Result<()> {
    let Some(filename) = last_url_segment(&image.path) else {
        bail!("image path has no filename: {}", image.path);
    };
    let url = ctx.api.asset_public_url(&image.path);
    let dest = ctx.paths.image_path(filename);

    let bytes =
        with_retry_if(EVENT_RETRY, || fetch_image(ctx.api.as_ref(), &url), retryable).await?;
    ctx.store.write(&dest, &bytes)?;

    assembler.register(
        row.id,
        BufferSeed {
            notebook_id: row.notebook_id,
            image_name: image.name.clone(),
            image_rel_path: ctx.paths.image_rel(filename),
        },
    );
    assembler.submit(NoteContentFrame {
        note_id: row.id,
        notebook_id: row.notebook_id,
        content: String::new(),
        version: 0,
        end: false,
    });
    Ok(())
}

async fn fetch_image(api: &dyn RemoteApi, url: &str) -> Result<Vec<u8>> {
    match tokio::time::timeout(IMAGE_FETCH_TIMEOUT, api.fetch_bytes(url, false)).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => bail!("image fetch timed out after {}s", IMAGE_FETCH_TIMEOUT.as_secs()),
    }
}
