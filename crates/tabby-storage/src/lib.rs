//! Snapshot files, raw page archive and the HTTP client for tabby-watch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info_span, Instrument};

mod atomic;
pub mod snapshot;

pub use snapshot::{
    read_snapshot, LoadedSnapshot, SnapshotError, SnapshotKind, SnapshotStore, WrittenRun,
    SNAPSHOT_STAMP_FORMAT,
};

pub const CRATE_NAME: &str = "tabby-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of raw fetched pages, laid out as
/// `<fetch stamp>/<source>/page-NNNN.<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    fn page_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        page: u32,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        Path::new(&fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(source_id)
            .join(format!("page-{page:04}.{content_hash}.{ext}"))
    }

    /// Archive one page body. A body already stored under the same
    /// stamp, page and hash is not written twice.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        page: u32,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_path(fetched_at, source_id, page, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path.parent().unwrap_or(self.root.as_path()).to_path_buf();

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archived page {}", absolute_path.display()))?;
        if deduplicated {
            debug!(path = %absolute_path.display(), "page already archived");
        } else {
            let staged = atomic::stage(&dir, bytes)
                .await
                .with_context(|| format!("staging page {page} in {}", dir.display()))?;
            atomic::commit(&staged, &absolute_path)
                .await
                .with_context(|| format!("archiving page {page} to {}", absolute_path.display()))?;
        }

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The source could not be reached or answered with a non-success status.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-shot HTTP GET client. Failures are returned, never retried.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %status, "fetched");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}
