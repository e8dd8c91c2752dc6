//! Record sources: remote metadata adapters plus the bounded fetch pool.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ecat_core::{FetchFailure, FetchFailureKind, FetchOutcome, Identifier, Record, SchemaError};
use ecat_storage::{BackoffPolicy, FetchError, RetryDisposition};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

mod ckan_site;
mod github;

pub use ckan_site::CkanSiteApi;
pub use github::{GithubRepoApi, DEFAULT_GITHUB_API};

pub const CRATE_NAME: &str = "ecat-sources";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("response did not match schema: {0}")]
    Schema(#[from] SchemaError),
}

impl ApiError {
    pub fn failure_kind(&self) -> FetchFailureKind {
        match self {
            Self::Transient(_) => FetchFailureKind::Transient,
            Self::NotFound(_) | Self::Permanent(_) | Self::Schema(_) => FetchFailureKind::Permanent,
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        if err.status() == Some(404) {
            return Self::NotFound(err.to_string());
        }
        match err.disposition() {
            RetryDisposition::Retryable => Self::Transient(err.to_string()),
            RetryDisposition::NonRetryable => Self::Permanent(err.to_string()),
        }
    }
}

/// Per-entity metadata endpoint.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_metadata(&self, identifier: &Identifier) -> Result<Record, ApiError>;
}

/// Fetches one normalized record per identifier through a fixed-width worker pool.
#[derive(Clone)]
pub struct RecordSource {
    api: Arc<dyn MetadataApi>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl RecordSource {
    pub fn new(api: Arc<dyn MetadataApi>, backoff: BackoffPolicy) -> Self {
        Self {
            api,
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns exactly one outcome per input position, sorted by `correlation`.
    pub async fn fetch_all(
        &self,
        identifiers: &[Identifier],
        concurrency: usize,
        per_call_timeout: Duration,
    ) -> Vec<FetchOutcome> {
        let width = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(width));
        let collector = Arc::new(Mutex::new(Vec::with_capacity(identifiers.len())));
        let mut workers = JoinSet::new();

        info!(
            source = self.api.name(),
            requested = identifiers.len(),
            width,
            "dispatching fetches"
        );

        for (correlation, identifier) in identifiers.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                warn!(remaining = identifiers.len() - correlation, "fetch cancelled before dispatch");
                let mut outcomes = collector.lock().await;
                for (skipped, id) in identifiers.iter().enumerate().skip(correlation) {
                    outcomes.push(FetchOutcome::failure(
                        skipped,
                        id.clone(),
                        0,
                        FetchFailure::new(FetchFailureKind::Cancelled, "run cancelled before dispatch"),
                    ));
                }
                break;
            };

            let api = Arc::clone(&self.api);
            let collector = Arc::clone(&collector);
            let backoff = self.backoff;
            let identifier = identifier.clone();
            let span = info_span!("fetch", correlation, identifier = %identifier);
            workers.spawn(
                async move {
                    let _permit = permit;
                    let outcome =
                        fetch_with_retry(api.as_ref(), correlation, identifier, backoff, per_call_timeout).await;
                    collector.lock().await.push(outcome);
                }
                .instrument(span),
            );
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "fetch worker terminated abnormally");
            }
        }

        let mut outcomes = std::mem::take(&mut *collector.lock().await);
        let reported: HashSet<usize> = outcomes.iter().map(|o| o.correlation).collect();
        for (correlation, identifier) in identifiers.iter().enumerate() {
            if !reported.contains(&correlation) {
                outcomes.push(FetchOutcome::failure(
                    correlation,
                    identifier.clone(),
                    0,
                    FetchFailure::new(FetchFailureKind::Transient, "fetch worker did not report an outcome"),
                ));
            }
        }
        outcomes.sort_by_key(|o| o.correlation);
        outcomes
    }
}

async fn fetch_with_retry(
    api: &dyn MetadataApi,
    correlation: usize,
    identifier: Identifier,
    backoff: BackoffPolicy,
    per_call_timeout: Duration,
) -> FetchOutcome {
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let failure = match tokio::time::timeout(per_call_timeout, api.get_metadata(&identifier)).await {
            Ok(Ok(record)) => {
                debug!(attempt, fields = record.len(), "fetched");
                return FetchOutcome::success(correlation, identifier, attempt, record);
            }
            Ok(Err(err)) => FetchFailure::new(err.failure_kind(), err.to_string()),
            Err(_) => FetchFailure::new(
                FetchFailureKind::Timeout,
                format!("no response within {}ms", per_call_timeout.as_millis()),
            ),
        };

        let retryable = matches!(failure.kind, FetchFailureKind::Transient | FetchFailureKind::Timeout);
        if !retryable || attempt >= max_attempts {
            warn!(attempt, kind = ?failure.kind, message = %failure.message, "fetch failed");
            return FetchOutcome::failure(correlation, identifier, attempt, failure);
        }
        tokio::time::sleep(backoff.delay_for_attempt(attempt - 1)).await;
    }
}
