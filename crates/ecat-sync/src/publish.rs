use std::sync::Arc;

use ecat_core::{ChangeEvent, Snapshot};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, CatalogError};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("snapshot replace rejected: {0}")]
    ReplaceRejected(#[source] CatalogError),
    #[error("time-series append rejected, snapshot restored: {0}")]
    AppendRejected(#[source] CatalogError),
    #[error("catalog is inconsistent and needs manual intervention: {0}")]
    FatalInconsistency(String),
}

impl PublishError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalInconsistency(_))
    }
}

#[derive(Debug, Default)]
pub struct PublishResult {
    pub applied_count: usize,
    pub rolled_back: bool,
    pub error: Option<PublishError>,
}

/// Applies a snapshot and its events as one unit, compensating on failure.
#[derive(Clone)]
pub struct Publisher {
    catalog: Arc<dyn Catalog>,
    dataset_id: String,
}

impl Publisher {
    pub fn new(catalog: Arc<dyn Catalog>, dataset_id: impl Into<String>) -> Self {
        Self {
            catalog,
            dataset_id: dataset_id.into(),
        }
    }

    pub async fn publish(&self, next: &Snapshot, events: &[ChangeEvent], previous: &Snapshot) -> PublishResult {
        let dataset_id = self.dataset_id.as_str();
        if events.is_empty() && next == previous {
            info!(dataset_id, "nothing to publish");
            return PublishResult::default();
        }

        if let Err(err) = self.catalog.replace_snapshot(dataset_id, next).await {
            let error = match err {
                CatalogError::Inconsistent(detail) => PublishError::FatalInconsistency(detail),
                other => PublishError::ReplaceRejected(other),
            };
            warn!(dataset_id, error = %error, "snapshot replace failed");
            return PublishResult {
                error: Some(error),
                ..PublishResult::default()
            };
        }

        if events.is_empty() {
            return PublishResult::default();
        }

        match self.catalog.append_time_series(dataset_id, events).await {
            Ok(()) => {
                info!(dataset_id, events = events.len(), "published");
                PublishResult {
                    applied_count: events.len(),
                    ..PublishResult::default()
                }
            }
            Err(append_err) => {
                warn!(dataset_id, error = %append_err, "append failed, restoring previous snapshot");
                match self.catalog.replace_snapshot(dataset_id, previous).await {
                    Ok(()) => PublishResult {
                        applied_count: 0,
                        rolled_back: true,
                        error: Some(PublishError::AppendRejected(append_err)),
                    },
                    Err(restore_err) => {
                        error!(dataset_id, error = %restore_err, "snapshot restore failed");
                        PublishResult {
                            applied_count: 0,
                            rolled_back: false,
                            error: Some(PublishError::FatalInconsistency(format!(
                                "append failed ({append_err}); restoring snapshot failed ({restore_err})"
                            ))),
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use chrono::Utc;
    use ecat_core::{Identifier, Record};

    fn fixtures() -> (Snapshot, Snapshot, Vec<ChangeEvent>) {
        let previous: Snapshot = [(Identifier::from("e1"), Record::new().with("stars", 5))]
            .into_iter()
            .collect();
        let mut next = previous.clone();
        next.insert(Identifier::from("e2"), Record::new().with("stars", 1));
        let events = vec![ChangeEvent::added(
            Identifier::from("e2"),
            Utc::now(),
            Record::new().with("stars", 1),
        )];
        (previous, next, events)
    }

    #[tokio::test]
    async fn successful_publish_applies_snapshot_and_events() {
        let (previous, next, events) = fixtures();
        let catalog = Arc::new(MemoryCatalog::new().with_dataset("ext", previous.clone()));
        let result = Publisher::new(catalog.clone(), "ext")
            .publish(&next, &events, &previous)
            .await;

        assert!(result.error.is_none());
        assert_eq!(result.applied_count, 1);
        assert_eq!(catalog.snapshot("ext"), Some(next));
        assert_eq!(catalog.time_series("ext"), events);
    }

    #[tokio::test]
    async fn no_op_publish_touches_nothing() {
        let (previous, _, _) = fixtures();
        let catalog = Arc::new(MemoryCatalog::new().with_dataset("ext", previous.clone()));
        let result = Publisher::new(catalog.clone(), "ext")
            .publish(&previous, &[], &previous)
            .await;
        assert_eq!(result.applied_count, 0);
        assert_eq!(catalog.replace_calls(), 0);
        assert_eq!(catalog.append_calls(), 0);
    }

    #[tokio::test]
    async fn replace_failure_leaves_catalog_untouched() {
        let (previous, next, events) = fixtures();
        let catalog = Arc::new(MemoryCatalog::new().with_dataset("ext", previous.clone()));
        catalog.push_replace_result(false);

        let result = Publisher::new(catalog.clone(), "ext")
            .publish(&next, &events, &previous)
            .await;
        assert!(matches!(result.error, Some(PublishError::ReplaceRejected(_))));
        assert!(!result.rolled_back);
        assert_eq!(catalog.snapshot("ext"), Some(previous));
        assert!(catalog.time_series("ext").is_empty());
        assert_eq!(catalog.append_calls(), 0);
    }

    #[tokio::test]
    async fn append_failure_rolls_snapshot_back() {
        let (previous, next, events) = fixtures();
        let catalog = Arc::new(MemoryCatalog::new().with_dataset("ext", previous.clone()));
        catalog.push_append_result(false);

        let result = Publisher::new(catalog.clone(), "ext")
            .publish(&next, &events, &previous)
            .await;
        assert!(matches!(result.error, Some(PublishError::AppendRejected(_))));
        assert!(result.rolled_back);
        assert_eq!(result.applied_count, 0);
        assert_eq!(catalog.snapshot("ext"), Some(previous));
        assert!(catalog.time_series("ext").is_empty());
    }

    #[tokio::test]
    async fn failed_rollback_is_fatal() {
        let (previous, next, events) = fixtures();
        let catalog = Arc::new(MemoryCatalog::new().with_dataset("ext", previous.clone()));
        catalog.push_replace_result(true);
        catalog.push_replace_result(false);
        catalog.push_append_result(false);

        let result = Publisher::new(catalog.clone(), "ext")
            .publish(&next, &events, &previous)
            .await;
        let error = result.error.unwrap();
        assert!(error.is_fatal());
        assert!(!result.rolled_back);
    }

    #[tokio::test]
    async fn inconsistent_replace_is_fatal() {
        struct Broken;

        #[async_trait::async_trait]
        impl Catalog for Broken {
            async fn get_snapshot(&self, _: &str) -> Result<Snapshot, CatalogError> {
                Ok(Snapshot::new())
            }
            async fn replace_snapshot(&self, _: &str, _: &Snapshot) -> Result<(), CatalogError> {
                Err(CatalogError::Inconsistent("restore failed".into()))
            }
            async fn append_time_series(&self, _: &str, _: &[ChangeEvent]) -> Result<(), CatalogError> {
                Ok(())
            }
            async fn get_time_series(&self, _: &str) -> Result<Vec<ChangeEvent>, CatalogError> {
                Ok(Vec::new())
            }
        }

        let (previous, next, events) = fixtures();
        let result = Publisher::new(Arc::new(Broken), "ext")
            .publish(&next, &events, &previous)
            .await;
        assert!(result.error.is_some_and(|e| e.is_fatal()));
    }
}
