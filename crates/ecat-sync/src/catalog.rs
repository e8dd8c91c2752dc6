//! Remote dataset store holding the current snapshot and the change log.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use ecat_core::{ChangeEvent, Identifier, Snapshot};
use ecat_storage::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Transport(#[from] FetchError),
    #[error("catalog rejected {action}: {message}")]
    Rejected { action: String, message: String },
    #[error("unknown dataset `{0}`")]
    UnknownDataset(String),
    #[error("dataset `{dataset}` has no resource named like `{resource}`")]
    MissingResource { dataset: String, resource: String },
    #[error("invalid catalog row: {0}")]
    InvalidRow(String),
    #[error("identifier {0} appears more than once in the stored snapshot")]
    DuplicateIdentifier(Identifier),
    /// The snapshot could be neither replaced nor restored.
    #[error("catalog left inconsistent: {0}")]
    Inconsistent(String),
}

/// `replace_snapshot` swaps the full snapshot as one unit from the caller's view.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Cheap reachability check made before any run reads or writes.
    async fn check_connection(&self) -> Result<(), CatalogError> {
        Ok(())
    }

    async fn get_snapshot(&self, dataset_id: &str) -> Result<Snapshot, CatalogError>;

    async fn replace_snapshot(&self, dataset_id: &str, snapshot: &Snapshot) -> Result<(), CatalogError>;

    async fn append_time_series(&self, dataset_id: &str, events: &[ChangeEvent]) -> Result<(), CatalogError>;

    async fn get_time_series(&self, dataset_id: &str) -> Result<Vec<ChangeEvent>, CatalogError>;
}

#[derive(Debug, Default, Clone)]
struct MemoryDataset {
    snapshot: Snapshot,
    time_series: Vec<ChangeEvent>,
}

#[derive(Debug, Default)]
struct Script {
    unreachable: bool,
    replace: VecDeque<bool>,
    append: VecDeque<bool>,
    replace_calls: usize,
    append_calls: usize,
}

/// In-process catalog with read-your-writes semantics and scriptable failures.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    datasets: Mutex<HashMap<String, MemoryDataset>>,
    script: Mutex<Script>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, dataset_id: &str, snapshot: Snapshot) -> Self {
        self.lock_datasets().insert(
            dataset_id.to_string(),
            MemoryDataset {
                snapshot,
                time_series: Vec::new(),
            },
        );
        self
    }

    /// Makes `check_connection` and every later call fail.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock_script().unreachable = unreachable;
    }

    /// Queues the result of the next un-scripted `replace_snapshot` call.
    pub fn push_replace_result(&self, ok: bool) {
        self.lock_script().replace.push_back(ok);
    }

    pub fn push_append_result(&self, ok: bool) {
        self.lock_script().append.push_back(ok);
    }

    pub fn snapshot(&self, dataset_id: &str) -> Option<Snapshot> {
        self.lock_datasets().get(dataset_id).map(|d| d.snapshot.clone())
    }

    pub fn time_series(&self, dataset_id: &str) -> Vec<ChangeEvent> {
        self.lock_datasets()
            .get(dataset_id)
            .map(|d| d.time_series.clone())
            .unwrap_or_default()
    }

    pub fn replace_calls(&self) -> usize {
        self.lock_script().replace_calls
    }

    pub fn append_calls(&self) -> usize {
        self.lock_script().append_calls
    }

    fn lock_datasets(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryDataset>> {
        self.datasets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn rejected(action: &str) -> CatalogError {
    CatalogError::Rejected {
        action: action.to_string(),
        message: "injected failure".to_string(),
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn check_connection(&self) -> Result<(), CatalogError> {
        if self.lock_script().unreachable {
            return Err(rejected("site_read"));
        }
        Ok(())
    }

    async fn get_snapshot(&self, dataset_id: &str) -> Result<Snapshot, CatalogError> {
        self.check_connection().await?;
        self.lock_datasets()
            .get(dataset_id)
            .map(|d| d.snapshot.clone())
            .ok_or_else(|| CatalogError::UnknownDataset(dataset_id.to_string()))
    }

    async fn replace_snapshot(&self, dataset_id: &str, snapshot: &Snapshot) -> Result<(), CatalogError> {
        let ok = {
            let mut script = self.lock_script();
            script.replace_calls += 1;
            script.replace.pop_front().unwrap_or(true)
        };
        if !ok {
            return Err(rejected("replace_snapshot"));
        }
        self.lock_datasets()
            .entry(dataset_id.to_string())
            .or_default()
            .snapshot = snapshot.clone();
        Ok(())
    }

    async fn append_time_series(&self, dataset_id: &str, events: &[ChangeEvent]) -> Result<(), CatalogError> {
        let ok = {
            let mut script = self.lock_script();
            script.append_calls += 1;
            script.append.pop_front().unwrap_or(true)
        };
        if !ok {
            return Err(rejected("append_time_series"));
        }
        self.lock_datasets()
            .entry(dataset_id.to_string())
            .or_default()
            .time_series
            .extend_from_slice(events);
        Ok(())
    }

    async fn get_time_series(&self, dataset_id: &str) -> Result<Vec<ChangeEvent>, CatalogError> {
        self.check_connection().await?;
        Ok(self.time_series(dataset_id))
    }
}
