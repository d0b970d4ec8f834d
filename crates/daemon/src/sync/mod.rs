// Bulk reconciliation: manifest diff plus bounded, retried downloads.
//
// Fetches the manifest of everything changed since the checkpoint, computes
// the locally-missing subset, and downloads it through the bounded runner
// with per-item retry. Assets are immutable by filename and skipped when
// present; rendered documents are always re-fetched (remote wins). The
// checkpoint advances even when individual downloads fail.

pub mod listener;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use notelens_common::naming::last_url_segment;
use notelens_common::types::SyncCheckpoint;

use crate::limiter::run_with_limit;
use crate::retry::{with_retry_if, RetryPolicy};
use crate::service::{ApiError, RemoteApi};
use crate::settings::CheckpointStore;
use crate::store::{find_by_suffix, LocalStore};

/// Concurrency ceiling for bulk downloads.
pub const DOWNLOAD_CONCURRENCY: usize = 5;

/// Retry policy for bulk downloads.
pub const DOWNLOAD_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(500));

/// Retry policy for feed-driven single downloads.
pub const EVENT_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::from_millis(100));

/// Progress reporting callback for user-visible sync status lines.
pub type ProgressSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Vault-relative layout of the sync folder.
#[derive(Debug, Clone)]
pub struct SyncPaths {
    /// Folder the synced notebooks land in, e.g. `notebooks`.
    pub root: String,
}

impl SyncPaths {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn images_dir(&self) -> String {
        format!("{}/images", self.root)
    }

    pub fn doc_path(&self, name: &str) -> String {
        format!("{}/{name}", self.root)
    }

    pub fn image_path(&self, filename: &str) -> String {
        format!("{}/images/{filename}", self.root)
    }

    /// Image path relative to the sync root, as embedded in documents.
    pub fn image_rel(&self, filename: &str) -> String {
        format!("images/{filename}")
    }
}

/// Shared collaborators for the sync engine.
pub struct SyncContext {
    pub api: Arc<dyn RemoteApi>,
    pub store: Arc<dyn LocalStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub paths: SyncPaths,
    pub progress: ProgressSink,
    /// Origin tag attached to this client's own writes; feed events
    /// carrying it are ignored (loopback suppression).
    pub source_id: String,
}

impl SyncContext {
    pub fn report(&self, message: &str) {
        (self.progress)(message);
    }

    pub fn is_loopback(&self, source: Option<&str>) -> bool {
        source == Some(self.source_id.as_str())
    }
}

/// One unit of download work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub dest: String,
    pub needs_auth: bool,
}

/// Whether a failed download should consume another retry attempt.
fn retryable(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<ApiError>() {
        Some(api_error) => api_error.is_retryable(),
        None => true,
    }
}

/// Fetch one item and materialize it in the local store.
///
/// Documents (`.md` destinations) resolve the existing local file by the
/// `-<id>.md` suffix: an exact name match or a draft-sentinel destination
/// overwrites in place, a mismatched name replaces the stale file, and a
/// draft destination with nothing to update skips entirely. Other assets
/// are content-addressed by filename: an existing destination means no
/// network request at all.
pub async fn download_item(
    api: &dyn RemoteApi,
    store: &dyn LocalStore,
    item: &DownloadItem,
) -> Result<()> {
    if item.dest.ends_with(".md") {
        return materialize_document(api, store, item).await;
    }

    if store.exists(&item.dest) {
        debug!(dest = %item.dest, "asset already present, skipping download");
        return Ok(());
    }
    let bytes = api.fetch_bytes(&item.url, item.needs_auth).await?;
    store.write(&item.dest, &bytes)
}

async fn materialize_document(
    api: &dyn RemoteApi,
    store: &dyn LocalStore,
    item: &DownloadItem,
) -> Result<()> {
    let (dir, filename) = match item.dest.rsplit_once('/') {
        Some(parts) => parts,
        None => ("", item.dest.as_str()),
    };

    // "<title>-<id>.md" => suffix "-<id>.md"; without an id tail there is
    // nothing to resolve and the destination is written as-is.
    let Some((_, id_tail)) = filename.rsplit_once('-') else {
        let bytes = api.fetch_bytes(&item.url, item.needs_auth).await?;
        return store.write(&item.dest, &bytes);
    };
    let suffix = format!("-{id_tail}");
    let is_draft_dest = filename == format!("!{suffix}");

    let existing =
        if dir.is_empty() { None } else { find_by_suffix(store, dir, &suffix)? };

    match existing {
        Some(name) if name == filename || is_draft_dest => {
            // The file that already carries this id keeps its name; only
            // its content is replaced.
            let bytes = api.fetch_bytes(&item.url, item.needs_auth).await?;
            store.write(&format!("{dir}/{name}"), &bytes)
        }
        Some(stale) => {
            // Title changed remotely: drop the stale materialization.
            store.delete(&format!("{dir}/{stale}"))?;
            let bytes = api.fetch_bytes(&item.url, item.needs_auth).await?;
            store.write(&item.dest, &bytes)
        }
        None if is_draft_dest => {
            debug!(dest = %item.dest, "no document matches draft destination, skipping");
            Ok(())
        }
        None => {
            let bytes = api.fetch_bytes(&item.url, item.needs_auth).await?;
            store.write(&item.dest, &bytes)
        }
    }
}

/// One reconciliation pass.
///
/// Returns the advanced checkpoint; persisting it is the caller's job
/// (see [`refetch`]). Partial download failures do not abort the pass.
pub async fn run_sync(
    ctx: &SyncContext,
    since: Option<DateTime<Utc>>,
) -> Result<SyncCheckpoint> {
    ctx.report("Fetching data...");
    ctx.store
        .create_dir_all(&ctx.paths.root)
        .context("failed to create sync folder")?;
    ctx.store
        .create_dir_all(&ctx.paths.images_dir())
        .context("failed to create images folder")?;

    let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let manifest =
        ctx.api.fetch_manifest(since).await.context("failed to fetch manifest")?;

    let mut downloads = Vec::new();
    for asset_url in &manifest.file_list.assets {
        let Some(filename) = last_url_segment(asset_url) else {
            warn!(url = %asset_url, "asset url has no filename, skipping");
            continue;
        };
        let dest = ctx.paths.image_path(filename);
        if ctx.store.exists(&dest) {
            continue;
        }
        downloads.push(DownloadItem { url: asset_url.clone(), dest, needs_auth: false });
    }
    for markdown in &manifest.file_list.markdowns {
        downloads.push(DownloadItem {
            url: markdown.url.clone(),
            dest: ctx.paths.doc_path(&markdown.name),
            needs_auth: true,
        });
    }

    let total = downloads.len();
    ctx.report(&format!("Downloading... 0/{total}"));

    let tasks: Vec<_> = downloads
        .into_iter()
        .map(|item| {
            let api = Arc::clone(&ctx.api);
            let store = Arc::clone(&ctx.store);
            async move {
                with_retry_if(
                    DOWNLOAD_RETRY,
                    || download_item(api.as_ref(), store.as_ref(), &item),
                    retryable,
                )
                .await
            }
        })
        .collect();

    let progress = Arc::clone(&ctx.progress);
    let outcome = run_with_limit(tasks, DOWNLOAD_CONCURRENCY, move |done, total| {
        progress(&format!("Downloading... {done}/{total}"));
    })
    .await;

    if outcome.failed > 0 {
        ctx.report(&format!("Sync Completed with {} failed downloads", outcome.failed));
    } else {
        ctx.report("Sync Completed");
    }
    info!(total = outcome.total, failed = outcome.failed, "bulk sync finished");

    Ok(SyncCheckpoint { last_synced_time: Utc::now(), sync_timestamp: manifest.last_updated })
}

/// Reconcile from the persisted checkpoint and advance it on completion.
pub async fn refetch(ctx: &SyncContext) -> Result<SyncCheckpoint> {
    let current = ctx.checkpoints.checkpoint();
    let since = if current.is_fresh() { None } else { Some(current.sync_timestamp) };
    let next = run_sync(ctx, since).await?;
    ctx.checkpoints.advance(next).context("failed to persist checkpoint")?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use notelens_common::protocol::manifest::{FileList, Manifest, MarkdownEntry};

    use crate::testutil::{test_context, TestContext};

    use super::*;

    fn manifest_with(assets: &[&str], markdowns: &[(&str, &str)], ts: i64) -> Manifest {
        Manifest {
            last_updated: Utc.timestamp_millis_opt(ts).unwrap(),
            file_list: FileList {
                assets: assets.iter().map(|s| s.to_string()).collect(),
                markdowns: markdowns
                    .iter()
                    .map(|(url, name)| MarkdownEntry { url: url.to_string(), name: name.to_string() })
                    .collect(),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_sync_downloads_everything() {
        let TestContext { ctx, api, reports, vault: _vault, .. } = test_context();
        api.set_manifest(manifest_with(
            &["https://cdn.test/images/a.png", "https://cdn.test/images/b.png"],
            &[("https://svc.test/download?id=42", "Foo-42.md")],
            1_700_000_000_000,
        ));
        api.add_body("https://cdn.test/images/a.png", b"png-a");
        api.add_body("https://cdn.test/images/b.png", b"png-b");
        api.add_body("https://svc.test/download?id=42", b"# Foo");

        let checkpoint = run_sync(&ctx, None).await.unwrap();

        assert_eq!(api.request_count(), 3);
        assert!(ctx.store.exists("notebooks/images/a.png"));
        assert!(ctx.store.exists("notebooks/images/b.png"));
        assert_eq!(
            ctx.store.read_to_string("notebooks/Foo-42.md").unwrap().as_deref(),
            Some("# Foo")
        );
        assert_eq!(checkpoint.sync_timestamp.timestamp_millis(), 1_700_000_000_000);

        let lines = reports.lock().unwrap().clone();
        assert!(lines.contains(&"Fetching data...".to_string()));
        assert!(lines.contains(&"Downloading... 3/3".to_string()));
        assert_eq!(lines.last().map(String::as_str), Some("Sync Completed"));
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_skips_existing_assets() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        api.set_manifest(manifest_with(
            &["https://cdn.test/images/a.png"],
            &[("https://svc.test/download?id=42", "Foo-42.md")],
            10,
        ));
        api.add_body("https://cdn.test/images/a.png", b"png-a");
        api.add_body("https://svc.test/download?id=42", b"# Foo");

        run_sync(&ctx, None).await.unwrap();
        assert_eq!(api.request_count(), 2);

        run_sync(&ctx, None).await.unwrap();
        // Asset untouched; only the unconditional document re-fetch ran.
        assert_eq!(api.requests_for("https://cdn.test/images/a.png"), 1);
        assert_eq!(api.requests_for("https://svc.test/download?id=42"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_download_counts_but_does_not_abort() {
        let TestContext { ctx, api, reports, vault: _vault, .. } = test_context();
        api.set_manifest(manifest_with(
            &["https://cdn.test/images/bad.png", "https://cdn.test/images/good.png"],
            &[],
            20,
        ));
        api.add_body("https://cdn.test/images/good.png", b"png");
        api.fail("https://cdn.test/images/bad.png");

        let checkpoint = run_sync(&ctx, None).await.unwrap();

        assert!(ctx.store.exists("notebooks/images/good.png"));
        assert!(!ctx.store.exists("notebooks/images/bad.png"));
        // The failing item was retried to exhaustion.
        assert_eq!(api.requests_for("https://cdn.test/images/bad.png"), 3);
        // Best-effort: the checkpoint still advances.
        assert_eq!(checkpoint.sync_timestamp.timestamp_millis(), 20);

        let lines = reports.lock().unwrap().clone();
        assert_eq!(
            lines.last().map(String::as_str),
            Some("Sync Completed with 1 failed downloads")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn refetch_persists_the_checkpoint() {
        let TestContext { ctx, api, checkpoints, vault: _vault, .. } = test_context();
        api.set_manifest(manifest_with(&[], &[], 30));

        refetch(&ctx).await.unwrap();
        assert_eq!(checkpoints.checkpoint().sync_timestamp.timestamp_millis(), 30);
        // The next refetch queries from the stored high-water mark.
        api.set_manifest(manifest_with(&[], &[], 40));
        refetch(&ctx).await.unwrap();
        assert_eq!(
            api.manifest_since(),
            vec![0, 30],
            "second pass should pass the persisted mark as `since`"
        );
    }

    // ── Document materialization ───────────────────────────────────

    #[tokio::test]
    async fn existing_asset_triggers_no_request() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        ctx.store.write("notebooks/images/a.png", b"old").unwrap();

        let item = DownloadItem {
            url: "https://cdn.test/images/a.png".into(),
            dest: "notebooks/images/a.png".into(),
            needs_auth: false,
        };
        download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item).await.unwrap();

        assert_eq!(api.request_count(), 0);
        // Content untouched: existence is the only check.
        assert_eq!(
            ctx.store.read_to_string("notebooks/images/a.png").unwrap().as_deref(),
            Some("old")
        );
    }

    #[tokio::test]
    async fn exact_name_match_overwrites_in_place() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        ctx.store.write("notebooks/Foo-42.md", b"old").unwrap();
        api.add_body("https://svc.test/download?id=42", b"new");

        let item = DownloadItem {
            url: "https://svc.test/download?id=42".into(),
            dest: "notebooks/Foo-42.md".into(),
            needs_auth: true,
        };
        download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item).await.unwrap();

        assert_eq!(
            ctx.store.read_to_string("notebooks/Foo-42.md").unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn renamed_notebook_replaces_stale_file() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        ctx.store.write("notebooks/Old Title-42.md", b"old").unwrap();
        api.add_body("https://svc.test/download?id=42", b"new");

        let item = DownloadItem {
            url: "https://svc.test/download?id=42".into(),
            dest: "notebooks/New Title-42.md".into(),
            needs_auth: true,
        };
        download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item).await.unwrap();

        assert!(!ctx.store.exists("notebooks/Old Title-42.md"));
        assert_eq!(
            ctx.store.read_to_string("notebooks/New Title-42.md").unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn draft_destination_updates_existing_file() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();
        ctx.store.write("notebooks/Foo-42.md", b"old").unwrap();
        api.add_body("https://svc.test/download?id=42", b"regenerated");

        let item = DownloadItem {
            url: "https://svc.test/download?id=42".into(),
            dest: "notebooks/!-42.md".into(),
            needs_auth: true,
        };
        download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item).await.unwrap();

        // The existing file keeps its name; no sentinel file appears.
        assert!(!ctx.store.exists("notebooks/!-42.md"));
        assert_eq!(
            ctx.store.read_to_string("notebooks/Foo-42.md").unwrap().as_deref(),
            Some("regenerated")
        );
    }

    #[tokio::test]
    async fn draft_destination_without_match_skips_entirely() {
        let TestContext { ctx, api, vault: _vault, .. } = test_context();

        let item = DownloadItem {
            url: "https://svc.test/download?id=42".into(),
            dest: "notebooks/!-42.md".into(),
            needs_auth: true,
        };
        download_item(ctx.api.as_ref(), ctx.store.as_ref(), &item).await.unwrap();

        assert_eq!(api.request_count(), 0);
        assert!(!ctx.store.exists("notebooks/!-42.md"));
    }
}
