//! Source downloads to the local download directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eduinfo_core::{SourceDescriptor, SourceType};
use reqwest::header::LAST_MODIFIED;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{header_text, FetchError, HttpFetcher};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: Option<String>,
    pub sha256: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the source's primary file. No partial file is left behind on failure.
    async fn download(&self, source: &SourceDescriptor) -> Result<DownloadedFile, DownloadError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownloader {
    fetcher: Arc<HttpFetcher>,
    download_dir: PathBuf,
}

impl HttpDownloader {
    pub fn new(fetcher: Arc<HttpFetcher>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            download_dir: download_dir.into(),
        }
    }

    pub fn file_name_for(source: &SourceDescriptor, at: DateTime<Utc>) -> String {
        let ext = match source.source_type {
            SourceType::Csv | SourceType::Dataset => "csv",
            SourceType::Api => "json",
        };
        format!("{}_{}.{ext}", source.id, at.format("%Y%m%d_%H%M%S%3f"))
    }

    async fn write_body(
        &self,
        url: &str,
        temp_path: &Path,
    ) -> Result<(u64, String, Option<String>), DownloadError> {
        let mut resp = self.fetcher.get_streaming(url).await?;
        let last_modified = header_text(resp.headers(), LAST_MODIFIED);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(temp_path)
            .await
            .map_err(|e| DownloadError::io(temp_path, e))?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = resp.chunk().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })? {
            hasher.update(&chunk);
            size += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(temp_path, e))?;
        }
        file.flush()
            .await
            .map_err(|e| DownloadError::io(temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| DownloadError::io(temp_path, e))?;

        Ok((size, hex::encode(hasher.finalize()), last_modified))
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, source: &SourceDescriptor) -> Result<DownloadedFile, DownloadError> {
        let span = info_span!("download", source_id = %source.id, url = %source.url);
        async {
            fs::create_dir_all(&self.download_dir)
                .await
                .map_err(|e| DownloadError::io(&self.download_dir, e))?;

            let target = self
                .download_dir
                .join(Self::file_name_for(source, Utc::now()));
            let partial = PartialFile::new(
                self.download_dir
                    .join(format!(".{}.{}.part", source.id, Uuid::new_v4())),
            );

            let (size, sha256, last_modified) =
                self.write_body(&source.url, partial.path()).await?;
            fs::rename(partial.path(), &target)
                .await
                .map_err(|err| DownloadError::io(&target, err))?;
            partial.keep();

            info!(path = %target.display(), size, %sha256, "download complete");
            Ok(DownloadedFile {
                path: target,
                size,
                last_modified,
                sha256,
                url: source.url.clone(),
            })
        }
        .instrument(span)
        .await
    }
}

/// In-progress download file. Removed on drop unless [`keep`](Self::keep) was called, so an
/// error or a dropped download future leaves nothing behind.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), error = %err, "could not remove partial download"),
        }
    }
}
