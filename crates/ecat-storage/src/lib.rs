//! HTTP plumbing and local run archive for the catalog harvester.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{RequestBuilder, StatusCode};
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ecat-storage";

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

/// Exponential backoff between attempts. `max_attempts` counts the first try.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
            timeout: Duration::from_secs(30),
            user_agent: None,
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
    #[error("malformed response from {url}: {message}")]
    Malformed { url: String, message: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request { source, .. } => classify_reqwest_error(source),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            Self::Malformed { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub headers: HeaderMap,
    pub body: JsonValue,
}

/// Thin JSON client. Each call is a single attempt; callers own retry policy.
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

    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        authorization: Option<&str>,
    ) -> Result<JsonResponse, FetchError> {
        let request = self.client.get(url).query(query);
        self.send(url, with_auth(request, authorization)).await
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &JsonValue,
        authorization: Option<&str>,
    ) -> Result<JsonResponse, FetchError> {
        let request = self.client.post(url).json(body);
        self.send(url, with_auth(request, authorization)).await
    }

    async fn send(&self, url: &str, request: RequestBuilder) -> Result<JsonResponse, FetchError> {
        let span = info_span!("http_request", url);
        async move {
            let resp = request.send().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let headers = resp.headers().clone();
            debug!(status = status.as_u16(), "response received");

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let bytes = resp.bytes().await.map_err(|source| FetchError::Request {
                url: final_url.clone(),
                source,
            })?;
            // 204 and other empty bodies decode as null
            let body = if bytes.iter().all(u8::is_ascii_whitespace) {
                JsonValue::Null
            } else {
                serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed {
                    url: final_url.clone(),
                    message: e.to_string(),
                })?
            };
            Ok(JsonResponse {
                status,
                final_url,
                headers,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

fn with_auth(request: RequestBuilder, authorization: Option<&str>) -> RequestBuilder {
    match authorization {
        Some(value) if !value.is_empty() => request.header(AUTHORIZATION, value),
        _ => request,
    }
}

#[derive(Debug, Clone)]
pub struct StoredRun {
    pub run_dir: PathBuf,
    pub summary_sha256: String,
    pub bytes_written: usize,
}

/// Per-run report directories plus per-dataset halt markers, written atomically.
#[derive(Debug, Clone)]
pub struct RunArchive {
    root: PathBuf,
}

impl RunArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn run_relative_path(&self, started_at: DateTime<Utc>, dataset_id: &str, run_id: Uuid) -> PathBuf {
        let stamp = started_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(dataset_id).join(format!("{stamp}_{run_id}"))
    }

    pub async fn write_run<S: Serialize, E: Serialize>(
        &self,
        started_at: DateTime<Utc>,
        dataset_id: &str,
        run_id: Uuid,
        summary: &S,
        events: &E,
    ) -> anyhow::Result<StoredRun> {
        let run_dir = self
            .root
            .join(self.run_relative_path(started_at, dataset_id, run_id));
        let summary_bytes = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
        let events_bytes = serde_json::to_vec_pretty(events).context("serializing change events")?;

        write_atomic(&run_dir.join("events.json"), &events_bytes).await?;
        write_atomic(&run_dir.join("summary.json"), &summary_bytes).await?;

        Ok(StoredRun {
            summary_sha256: Self::sha256_hex(&summary_bytes),
            bytes_written: summary_bytes.len() + events_bytes.len(),
            run_dir,
        })
    }

    pub fn halt_marker_path(&self, dataset_id: &str) -> PathBuf {
        self.root.join(dataset_id).join("HALTED")
    }

    pub async fn write_halt_marker(&self, dataset_id: &str, reason: &str) -> anyhow::Result<PathBuf> {
        let path = self.halt_marker_path(dataset_id);
        write_atomic(&path, reason.as_bytes()).await?;
        Ok(path)
    }

    pub async fn halt_reason(&self, dataset_id: &str) -> anyhow::Result<Option<String>> {
        let path = self.halt_marker_path(dataset_id);
        match fs::read_to_string(&path).await {
            Ok(reason) => Ok(Some(reason)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading halt marker {}", path.display())),
        }
    }

    /// Returns whether a marker existed.
    pub async fn clear_halt_marker(&self, dataset_id: &str) -> anyhow::Result<bool> {
        let path = self.halt_marker_path(dataset_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing halt marker {}", path.display())),
        }
    }
}

/// Writes through a uniquely named temp file and renames it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}
