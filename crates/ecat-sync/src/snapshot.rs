use std::collections::HashSet;
use std::sync::Arc;

use ecat_core::{ChangeEvent, Schema, Snapshot};
use tracing::debug;

use crate::catalog::{Catalog, CatalogError};

/// What the catalog held before this run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreviousState {
    pub snapshot: Snapshot,
    pub log: Vec<ChangeEvent>,
}

#[derive(Clone)]
pub struct SnapshotStore {
    catalog: Arc<dyn Catalog>,
}

impl SnapshotStore {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn load(&self, dataset_id: &str, schema: &Schema) -> Result<PreviousState, CatalogError> {
        let snapshot = self.catalog.get_snapshot(dataset_id).await?;
        for (id, record) in snapshot.iter() {
            schema
                .check_record(record)
                .map_err(|e| CatalogError::InvalidRow(format!("{id}: {e}")))?;
        }
        let log = self.catalog.get_time_series(dataset_id).await?;
        debug!(dataset_id, records = snapshot.len(), events = log.len(), "loaded previous state");
        Ok(PreviousState { snapshot, log })
    }
}

/// Drops events whose (identifier, kind, timestamp) is already logged or repeated.
pub fn dedupe_events(events: Vec<ChangeEvent>, log: &[ChangeEvent]) -> Vec<ChangeEvent> {
    let mut seen: HashSet<_> = log.iter().map(ChangeEvent::dedup_key).collect();
    events
        .into_iter()
        .filter(|event| seen.insert(event.dedup_key()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use chrono::{TimeZone, Utc};
    use ecat_core::{FieldValue, Identifier, Record};

    #[tokio::test]
    async fn load_rejects_mistyped_records() {
        let bad: Snapshot = [(Identifier::from("a"), Record::new().with("stars", "many"))]
            .into_iter()
            .collect();
        let store = SnapshotStore::new(Arc::new(MemoryCatalog::new().with_dataset("ext", bad)));
        let err = store.load("ext", &Schema::extensions()).await.unwrap_err();
        assert!(matches!(err, CatalogError::InvalidRow(_)));
    }

    #[tokio::test]
    async fn load_returns_snapshot_and_log() {
        let good: Snapshot = [(Identifier::from("a"), Record::new().with("stars", FieldValue::Int(3)))]
            .into_iter()
            .collect();
        let store = SnapshotStore::new(Arc::new(MemoryCatalog::new().with_dataset("ext", good.clone())));
        let previous = store.load("ext", &Schema::extensions()).await.unwrap();
        assert_eq!(previous.snapshot, good);
        assert!(previous.log.is_empty());
    }

    #[test]
    fn already_logged_events_are_dropped() {
        let ts = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let logged = ChangeEvent::added(Identifier::from("a"), ts, Record::new());
        let fresh = ChangeEvent::added(Identifier::from("b"), ts, Record::new());
        let kept = dedupe_events(vec![logged.clone(), fresh.clone(), fresh.clone()], &[logged]);
        assert_eq!(kept, vec![fresh]);
    }

    #[test]
    fn logged_events_match_at_second_precision() {
        let stored = Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap();
        let observed = stored + chrono::Duration::milliseconds(417);
        let logged = ChangeEvent::added(Identifier::from("a"), stored, Record::new());
        let replay = ChangeEvent::added(Identifier::from("a"), observed, Record::new());
        let later = ChangeEvent::added(Identifier::from("a"), stored + chrono::Duration::seconds(1), Record::new());

        let kept = dedupe_events(vec![replay, later.clone()], &[logged]);
        assert_eq!(kept, vec![later]);
    }
}
