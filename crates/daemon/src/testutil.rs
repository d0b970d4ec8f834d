// Shared test doubles for the daemon test suites.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use notelens_common::protocol::manifest::Manifest;
use notelens_common::types::{NoteId, NotebookId, SyncCheckpoint};

use crate::service::{AccountInfo, ApiError, NoteSource, RemoteApi};
use crate::settings::CheckpointStore;
use crate::store::FsStore;
use crate::sync::{ProgressSink, SyncContext, SyncPaths};

/// Scripted in-memory stand-in for the remote service.
pub struct FakeApi {
    manifest: StdMutex<Manifest>,
    manifest_since: StdMutex<Vec<i64>>,
    bodies: StdMutex<HashMap<String, Vec<u8>>>,
    fail_urls: StdMutex<HashSet<String>>,
    requests: StdMutex<Vec<String>>,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            manifest: StdMutex::new(Manifest {
                last_updated: DateTime::<Utc>::UNIX_EPOCH,
                file_list: Default::default(),
            }),
            manifest_since: StdMutex::new(Vec::new()),
            bodies: StdMutex::new(HashMap::new()),
            fail_urls: StdMutex::new(HashSet::new()),
            requests: StdMutex::new(Vec::new()),
        })
    }

    pub fn set_manifest(&self, manifest: Manifest) {
        *self.manifest.lock().unwrap() = manifest;
    }

    pub fn add_body(&self, url: &str, bytes: &[u8]) {
        self.bodies.lock().unwrap().insert(url.to_string(), bytes.to_vec());
    }

    /// Make every request for `url` fail with a retryable error.
    pub fn fail(&self, url: &str) {
        self.fail_urls.lock().unwrap().insert(url.to_string());
    }

    /// Total download requests observed.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Download requests observed for one URL.
    pub fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// `since` arguments (epoch millis) of every manifest fetch.
    pub fn manifest_since(&self) -> Vec<i64> {
        self.manifest_since.lock().unwrap().clone()
    }

    pub fn manifest_fetches(&self) -> usize {
        self.manifest_since.lock().unwrap().len()
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn fetch_manifest(&self, since: DateTime<Utc>) -> Result<Manifest, ApiError> {
        self.manifest_since.lock().unwrap().push(since.timestamp_millis());
        Ok(self.manifest.lock().unwrap().clone())
    }

    async fn fetch_bytes(&self, url: &str, _needs_auth: bool) -> Result<Vec<u8>, ApiError> {
        self.requests.lock().unwrap().push(url.to_string());
        if self.fail_urls.lock().unwrap().contains(url) {
            return Err(ApiError::Remote(format!("injected failure for {url}")));
        }
        self.bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| ApiError::Remote(format!("no scripted body for {url}")))
    }

    async fn realtime_token(&self) -> Result<String, ApiError> {
        Ok("feed-token".to_string())
    }

    async fn account_info(&self) -> Result<AccountInfo, ApiError> {
        Ok(AccountInfo::default())
    }

    async fn generate_note(
        &self,
        _source: NoteSource,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), ApiError> {
        on_chunk("stubbed note");
        Ok(())
    }

    fn document_url(&self, notebook_id: NotebookId, note_id: Option<NoteId>) -> String {
        match note_id {
            Some(note_id) => {
                format!("https://svc.test/download?id={notebook_id}&note_id={note_id}")
            }
            None => format!("https://svc.test/download?id={notebook_id}"),
        }
    }

    fn asset_public_url(&self, storage_path: &str) -> String {
        format!("https://cdn.test/images/{storage_path}")
    }
}

/// In-memory checkpoint store recording every advance.
pub struct RecordingCheckpoints {
    state: StdMutex<SyncCheckpoint>,
    advances: StdMutex<Vec<SyncCheckpoint>>,
}

impl RecordingCheckpoints {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: StdMutex::new(SyncCheckpoint::epoch()),
            advances: StdMutex::new(Vec::new()),
        })
    }

    pub fn seed(&self, checkpoint: SyncCheckpoint) {
        *self.state.lock().unwrap() = checkpoint;
    }

    pub fn advances(&self) -> Vec<SyncCheckpoint> {
        self.advances.lock().unwrap().clone()
    }
}

impl CheckpointStore for RecordingCheckpoints {
    fn checkpoint(&self) -> SyncCheckpoint {
        *self.state.lock().unwrap()
    }

    fn advance(&self, checkpoint: SyncCheckpoint) -> Result<()> {
        *self.state.lock().unwrap() = checkpoint;
        self.advances.lock().unwrap().push(checkpoint);
        Ok(())
    }
}

/// A ready-to-use sync context over a temp vault and scripted fakes.
pub struct TestContext {
    pub ctx: Arc<SyncContext>,
    pub api: Arc<FakeApi>,
    pub checkpoints: Arc<RecordingCheckpoints>,
    pub reports: Arc<StdMutex<Vec<String>>>,
    /// Keeps the vault directory alive for the test's duration.
    pub vault: TempDir,
}

pub fn test_context() -> TestContext {
    let vault = TempDir::new().expect("temp vault");
    let api = FakeApi::new();
    let checkpoints = RecordingCheckpoints::new();
    let reports = Arc::new(StdMutex::new(Vec::new()));
    let sink: ProgressSink = {
        let reports = Arc::clone(&reports);
        Arc::new(move |line: &str| reports.lock().unwrap().push(line.to_string()))
    };

    let ctx = Arc::new(SyncContext {
        api: api.clone() as Arc<dyn RemoteApi>,
        store: Arc::new(FsStore::new(vault.path())),
        checkpoints: checkpoints.clone() as Arc<dyn CheckpointStore>,
        paths: SyncPaths::new("notebooks"),
        progress: sink,
        source_id: "this-client".to_string(),
    });

    TestContext { ctx, api, checkpoints, reports, vault }
}
