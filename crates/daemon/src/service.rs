// HTTP client for the remote notebook service.
//
// Every call carries the access key in the `x-access-key` header. The
// realtime feed transport lives in `sync::ws`; this module covers the
// request/response surface: manifest listing, document and asset
// downloads, realtime auth, account info, and streamed note generation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use thiserror::Error;

use notelens_common::protocol::manifest::Manifest;
use notelens_common::types::{NoteId, NotebookId};

pub const DEFAULT_BASE_URL: &str = "https://notelens.app";
pub const DEFAULT_STORAGE_URL: &str = "https://storage.notelens.app/public/images";

const ACCESS_KEY_HEADER: &str = "x-access-key";
const GENERIC_ERROR: &str = "Sorry, something went wrong. Please try again.";

/// Failure taxonomy for remote calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or rejected credential; never retried.
    #[error("access key was rejected, please log in again")]
    Unauthorized,

    /// The server answered with an error; the message is the server's own
    /// when the body decodes, the generic text otherwise.
    #[error("{0}")]
    Remote(String),

    /// Transport-level failure; retryable.
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The response decoded as something other than the contract shape.
    #[error("unexpected response from server")]
    Malformed,
}

impl ApiError {
    fn generic() -> Self {
        Self::Remote(GENERIC_ERROR.to_string())
    }

    /// Whether a retry wrapper should try this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Remote(_))
    }
}

/// Account details behind `GET /api/plugin/info`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccountInfo {
    pub email: Option<String>,
    pub plan: Option<String>,
    pub notes_used: Option<u64>,
    pub notes_limit: Option<u64>,
}

/// Image input for note generation.
pub enum NoteSource {
    /// Raw image bytes uploaded as a multipart file.
    File { bytes: Vec<u8>, filename: String },
    /// An image already uploaded out of band; only its URL is sent.
    Uploaded { url: String },
}

/// The remote service contract, abstracted for testability.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Manifest of everything changed since `since`.
    async fn fetch_manifest(&self, since: DateTime<Utc>) -> Result<Manifest, ApiError>;

    /// Download a URL, optionally authenticated.
    async fn fetch_bytes(&self, url: &str, needs_auth: bool) -> Result<Vec<u8>, ApiError>;

    /// Exchange the access key for a realtime channel token.
    async fn realtime_token(&self) -> Result<String, ApiError>;

    /// Account details for status display.
    async fn account_info(&self) -> Result<AccountInfo, ApiError>;

    /// Generate a note from an image, invoking `on_chunk` for each piece of
    /// streamed UTF-8 content as it arrives.
    async fn generate_note(
        &self,
        source: NoteSource,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), ApiError>;

    /// Download URL for a notebook's rendered document, optionally scoped
    /// to a single note's template.
    fn document_url(&self, notebook_id: NotebookId, note_id: Option<NoteId>) -> String;

    /// Public URL of an asset by its storage path.
    fn asset_public_url(&self, storage_path: &str) -> String;
}

// ── Production client ───────────────────────────────────────────────

/// Connection parameters for the service.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub storage_url: String,
    pub access_key: String,
}

impl ApiConfig {
    pub fn new(access_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            storage_url: DEFAULT_STORAGE_URL.to_string(),
            access_key: access_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// `reqwest`-backed implementation of [`RemoteApi`].
pub struct HttpApi {
    config: ApiConfig,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: ApiConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header(ACCESS_KEY_HEADER, &self.config.access_key)
    }

    /// Map an HTTP response to the error taxonomy, passing successes through.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ApiError::Unauthorized);
        }

        #[derive(Deserialize)]
        struct ErrorBody {
            message: Option<String>,
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.message)
            .unwrap_or_else(|| GENERIC_ERROR.to_string());
        Err(ApiError::Remote(message))
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch_manifest(&self, since: DateTime<Utc>) -> Result<Manifest, ApiError> {
        let url = format!(
            "{}/api/plugin/manifest?since={}",
            self.config.base_url,
            since.timestamp_millis()
        );
        let response = Self::check(self.authed(self.client.get(&url)).send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| ApiError::Malformed)
    }

    async fn fetch_bytes(&self, url: &str, needs_auth: bool) -> Result<Vec<u8>, ApiError> {
        let mut request = self.client.get(url);
        if needs_auth {
            request = self.authed(request);
        }
        let response = Self::check(request.send().await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn realtime_token(&self) -> Result<String, ApiError> {
        let url = format!("{}/api/plugin/auth", self.config.base_url);
        let response = Self::check(self.authed(self.client.get(&url)).send().await?).await?;
        Ok(response.text().await?)
    }

    async fn account_info(&self) -> Result<AccountInfo, ApiError> {
        let url = format!("{}/api/plugin/info", self.config.base_url);
        let response = Self::check(self.authed(self.client.get(&url)).send().await?).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|_| ApiError::Malformed)
    }

    async fn generate_note(
        &self,
        source: NoteSource,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), ApiError> {
        let url = format!("{}/api/plugin/make_note", self.config.base_url);
        let form = match source {
            NoteSource::File { bytes, filename } => reqwest::multipart::Form::new()
                .part("file", reqwest::multipart::Part::bytes(bytes).file_name(filename)),
            NoteSource::Uploaded { url } => reqwest::multipart::Form::new().text("path", url),
        };
        let response = Self::check(
            self.authed(self.client.post(&url)).multipart(form).send().await?,
        )
        .await?;

        // Stream the body, holding back any split multi-byte sequence until
        // the rest of it arrives.
        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending.extend_from_slice(&chunk);
            match std::str::from_utf8(&pending) {
                Ok(text) => {
                    if !text.is_empty() {
                        on_chunk(text);
                    }
                    pending.clear();
                }
                Err(error) => {
                    let valid = error.valid_up_to();
                    if valid > 0 {
                        let text = std::str::from_utf8(&pending[..valid])
                            .expect("prefix validated by valid_up_to");
                        on_chunk(text);
                        pending.drain(..valid);
                    }
                }
            }
        }
        if !pending.is_empty() {
            return Err(ApiError::Malformed);
        }
        Ok(())
    }

    fn document_url(&self, notebook_id: NotebookId, note_id: Option<NoteId>) -> String {
        match note_id {
            Some(note_id) => format!(
                "{}/api/plugin/download?id={notebook_id}&note_id={note_id}",
                self.config.base_url
            ),
            None => format!("{}/api/plugin/download?id={notebook_id}", self.config.base_url),
        }
    }

    fn asset_public_url(&self, storage_path: &str) -> String {
        format!("{}/{}", self.config.storage_url.trim_end_matches('/'), storage_path)
    }
}
