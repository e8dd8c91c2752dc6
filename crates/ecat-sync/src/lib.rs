//! Fetch, merge and publish pipeline for catalog datasets.

use std::sync::Arc;

use anyhow::{Context, Result};
use ecat_core::RunSummary;
use ecat_sources::{CkanSiteApi, GithubRepoApi, MetadataApi, RecordSource};
use ecat_storage::{HttpClientConfig, HttpFetcher, RunArchive};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod catalog;
pub mod ckan;
pub mod config;
pub mod merge;
pub mod publish;
pub mod report;
pub mod runner;
pub mod snapshot;

pub use catalog::{Catalog, CatalogError, MemoryCatalog};
pub use ckan::{CkanBinding, CkanCatalog};
pub use config::{ConfigError, DatasetConfig, DatasetKind, DatasetRegistry, SyncConfig};
pub use merge::{MergeError, MergeOutput, MergePolicy, Merger};
pub use publish::{PublishError, PublishResult, Publisher};
pub use runner::{PipelineRunner, RunSettings};
pub use snapshot::{dedupe_events, PreviousState, SnapshotStore};

pub const CRATE_NAME: &str = "ecat-sync";

/// Wires the CKAN catalog and the dataset's metadata adapter from `config`.
pub fn build_runner(config: &SyncConfig, dataset: &DatasetConfig) -> Result<PipelineRunner> {
    let catalog_http = HttpFetcher::new(HttpClientConfig {
        user_agent: Some(config.user_agent.clone()),
        ..HttpClientConfig::default()
    })?;
    let api_http = HttpFetcher::new(HttpClientConfig {
        timeout: config.per_call_timeout,
        user_agent: Some(config.user_agent.clone()),
    })?;

    let schema = dataset.kind.schema();
    let catalog = CkanCatalog::new(catalog_http, config.ckan_url.clone(), config.ckan_api_key.clone())
        .with_binding(
            dataset.dataset_id.clone(),
            CkanBinding {
                schema: schema.clone(),
                snapshot_resource: dataset.snapshot_resource.clone(),
                timeseries_resource: dataset.timeseries_resource.clone(),
            },
        );
    let api: Arc<dyn MetadataApi> = match dataset.kind {
        DatasetKind::Extensions => Arc::new(GithubRepoApi::new(
            api_http,
            config.github_api_url.clone(),
            config.github_token.clone(),
        )),
        DatasetKind::Sites => Arc::new(CkanSiteApi::new(api_http)),
    };

    Ok(PipelineRunner::new(
        dataset.dataset_id.clone(),
        schema,
        RecordSource::new(api, config.backoff()),
        Arc::new(catalog),
        RunArchive::new(config.reports_dir.clone()),
        RunSettings::from(config),
    ))
}

pub async fn run_dataset_from_env(dataset_id: &str, cancel: CancellationToken) -> Result<RunSummary> {
    let config = SyncConfig::from_env()?;
    let registry = DatasetRegistry::load(&config.datasets_file).await?;
    let dataset = registry.get(dataset_id)?;
    let identifiers = config::load_identifiers(&dataset.identifiers_file)
        .await
        .with_context(|| format!("loading identifiers for {dataset_id}"))?;
    info!(dataset_id, identifiers = identifiers.len(), "starting sync");

    let runner = build_runner(&config, dataset)?.with_cancellation(cancel);
    Ok(runner.run(identifiers).await)
}
