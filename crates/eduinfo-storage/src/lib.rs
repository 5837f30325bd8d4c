//! HTTP fetch, download, and Postgres plumbing for the eduInfo pipeline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, Instrument};

pub mod db;
pub mod download;

pub use db::{
    connect_pool, connect_pool_lazy, is_valid_identifier, DbConfig, PgViewRefresher, RefreshError,
    TrackedTransaction, ViewRefreshTiming, ViewRefresher,
};
pub use download::{DownloadError, DownloadedFile, Downloader, HttpDownloader};

pub const CRATE_NAME: &str = "eduinfo-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Applies to metadata requests (HEAD, catalog API, CSV sampling).
    pub timeout: Duration,
    pub download_timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(120),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Response metadata from a `HEAD` probe. Redirects are already followed.
#[derive(Debug, Clone)]
pub struct HeadResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub last_modified: Option<String>,
}

/// First lines of a remote text file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSample {
    pub lines: Vec<String>,
    /// The sample ended before the requested line count (short file or timeout).
    pub partial: bool,
}

/// Network reads the change detector needs. Implemented by [`HttpFetcher`].
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    /// Raw `Last-Modified` header of `url`, `None` when the server does not send one.
    async fn last_modified(&self, url: &str) -> Result<Option<String>, FetchError>;

    async fn json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
    timeout: Duration,
    download_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
            timeout: config.timeout,
            download_timeout: config.download_timeout,
        })
    }

    /// Send with retries on transient failures. The final response is returned whatever its status.
    async fn send(
        &self,
        url: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, FetchError> {
        let _permit = self.global_limit.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(url, attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        source: err,
                    });
                }
            }
        }
    }

    pub async fn head(&self, url: &str) -> Result<HeadResponse, FetchError> {
        let span = info_span!("http_head", url);
        async {
            let resp = self
                .send(url, || self.client.head(url).timeout(self.timeout))
                .await?;
            let headers = resp.headers();
            Ok(HeadResponse {
                status: resp.status(),
                final_url: resp.url().to_string(),
                content_type: header_text(headers, CONTENT_TYPE),
                content_length: header_text(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
                last_modified: header_text(headers, LAST_MODIFIED),
            })
        }
        .instrument(span)
        .await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self
            .send(url, || self.client.get(url).timeout(self.timeout))
            .await?;
        let resp = ensure_success(resp)?;
        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Json {
            url: url.to_string(),
            source,
        })
    }

    /// Start a body download under the download timeout. The caller drains the response.
    pub async fn get_streaming(&self, url: &str) -> Result<Response, FetchError> {
        let resp = self
            .send(url, || self.client.get(url).timeout(self.download_timeout))
            .await?;
        ensure_success(resp)
    }

    /// Read only the first `max_lines` lines of a text resource.
    pub async fn sample_lines(&self, url: &str, max_lines: usize) -> Result<TextSample, FetchError> {
        let mut resp = self
            .send(url, || self.client.get(url).timeout(self.timeout))
            .await
            .and_then(ensure_success)?;

        let mut buffer = Vec::new();
        let mut partial = false;
        loop {
            if buffer.iter().filter(|b| **b == b'\n').count() >= max_lines {
                break;
            }
            match resp.chunk().await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => {
                    partial = true;
                    break;
                }
                Err(err) if err.is_timeout() && !buffer.is_empty() => {
                    partial = true;
                    break;
                }
                Err(source) => {
                    return Err(FetchError::Request {
                        url: url.to_string(),
                        source,
                    })
                }
            }
        }

        let text = String::from_utf8_lossy(&buffer);
        let lines = text
            .lines()
            .take(max_lines)
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect::<Vec<_>>();
        let partial = partial && lines.len() < max_lines;
        Ok(TextSample { lines, partial })
    }
}

pub(crate) fn header_text(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn ensure_success(resp: Response) -> Result<Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: resp.url().to_string(),
        })
    }
}

#[async_trait]
impl RemoteProbe for HttpFetcher {
    async fn last_modified(&self, url: &str) -> Result<Option<String>, FetchError> {
        let head = self.head(url).await?;
        if !head.status.is_success() {
            return Err(FetchError::HttpStatus {
                status: head.status.as_u16(),
                url: head.final_url,
            });
        }
        Ok(head.last_modified)
    }

    async fn json(&self, url: &str) -> Result<JsonValue, FetchError> {
        self.get_json(url).await
    }
}
