//! Combines the previous snapshot with fresh fetch outcomes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use ecat_core::{
    ChangeEvent, FetchOutcome, Identifier, Ownership, Record, Schema, SchemaError, Snapshot,
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("identifier {0} has more than one fetch outcome")]
    DuplicateIdentifier(Identifier),
    #[error("fetched record for {identifier} does not fit the schema: {source}")]
    TypeMismatch {
        identifier: Identifier,
        #[source]
        source: SchemaError,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    /// Previous entries missing from the fetch set are removed.
    pub authoritative_for_absence: bool,
    /// Stamped on every event of the run.
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutput {
    pub next: Snapshot,
    pub events: Vec<ChangeEvent>,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Merger {
    schema: Schema,
    policy: MergePolicy,
}

impl Merger {
    pub fn new(schema: Schema, policy: MergePolicy) -> Self {
        Self { schema, policy }
    }

    /// Pure function of its inputs; outcomes are processed in identifier order.
    pub fn merge(&self, previous: &Snapshot, outcomes: &[FetchOutcome]) -> Result<MergeOutput, MergeError> {
        let mut by_id: BTreeMap<&Identifier, &FetchOutcome> = BTreeMap::new();
        for outcome in outcomes {
            if by_id.insert(&outcome.identifier, outcome).is_some() {
                return Err(MergeError::DuplicateIdentifier(outcome.identifier.clone()));
            }
            if let Ok(record) = &outcome.result {
                self.schema
                    .check_record(record)
                    .map_err(|source| MergeError::TypeMismatch {
                        identifier: outcome.identifier.clone(),
                        source,
                    })?;
            }
        }

        let at = self.policy.observed_at;
        let mut next = previous.clone();
        let mut events = Vec::new();
        let mut failed = 0;

        for (id, outcome) in &by_id {
            let fetched = match &outcome.result {
                Ok(record) => record,
                Err(failure) => {
                    debug!(identifier = %id, error = %failure, "carrying previous record forward");
                    failed += 1;
                    continue;
                }
            };
            match previous.get(id) {
                Some(prev) => {
                    let merged = self.merge_record(prev, fetched);
                    if let Some(event) = diff(id, at, prev, &merged) {
                        events.push(event);
                    }
                    next.insert((*id).clone(), merged);
                }
                None => {
                    let record = self.merge_record(&Record::new(), fetched);
                    events.push(ChangeEvent::added((*id).clone(), at, record.clone()));
                    next.insert((*id).clone(), record);
                }
            }
        }

        if self.policy.authoritative_for_absence {
            for (id, prev) in previous.iter() {
                if !by_id.contains_key(id) {
                    next.remove(id);
                    events.push(ChangeEvent::removed(id.clone(), at, prev.clone()));
                }
            }
        }

        events.sort_by(|a, b| a.identifier.cmp(&b.identifier));
        Ok(MergeOutput { next, events, failed })
    }

    /// Source-owned fields follow `fetched`; curated fields keep `prev` unless `fetched` supplies one.
    fn merge_record(&self, prev: &Record, fetched: &Record) -> Record {
        let mut merged = Record::new();
        for (name, value) in prev.iter() {
            if self.schema.field(name).is_none() {
                merged.set(name, value.clone());
            }
        }
        for spec in &self.schema.fields {
            let value = match spec.ownership {
                Ownership::SourceOwned => fetched.get(&spec.name),
                Ownership::Curated => {
                    let candidate = fetched.get(&spec.name);
                    if candidate.is_null() {
                        prev.get(&spec.name)
                    } else {
                        candidate
                    }
                }
            };
            merged.set(spec.name.clone(), value.clone());
        }
        merged
    }
}

fn diff(id: &Identifier, at: DateTime<Utc>, prev: &Record, merged: &Record) -> Option<ChangeEvent> {
    let names: BTreeSet<&str> = prev.iter().chain(merged.iter()).map(|(k, _)| k).collect();
    let mut changed = Vec::new();
    let mut before = Record::new();
    let mut after = Record::new();
    for name in names {
        let (old, new) = (prev.get(name), merged.get(name));
        if old != new {
            changed.push(name.to_string());
            before.set(name, old.clone());
            after.set(name, new.clone());
        }
    }
    (!changed.is_empty()).then(|| ChangeEvent::updated(id.clone(), at, changed, before, after))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ecat_core::{ChangeKind, FetchFailure, FetchFailureKind, FieldValue};

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 6, 0, 0).unwrap()
    }

    fn merger(authoritative: bool) -> Merger {
        Merger::new(
            Schema::extensions(),
            MergePolicy {
                authoritative_for_absence: authoritative,
                observed_at: at(),
            },
        )
    }

    fn ok(i: usize, id: &str, record: Record) -> FetchOutcome {
        FetchOutcome::success(i, Identifier::from(id), 1, record)
    }

    fn failed(i: usize, id: &str) -> FetchOutcome {
        FetchOutcome::failure(
            i,
            Identifier::from(id),
            3,
            FetchFailure::new(FetchFailureKind::Transient, "503"),
        )
    }

    fn snapshot(entries: Vec<(&str, Record)>) -> Snapshot {
        entries
            .into_iter()
            .map(|(id, r)| (Identifier::from(id), r))
            .collect()
    }

    #[test]
    fn unchanged_fetch_produces_no_events() {
        let prev = snapshot(vec![("e1", Record::new().with("stars", 5))]);
        let out = merger(false)
            .merge(&prev, &[ok(0, "e1", Record::new().with("stars", 5))])
            .unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.next, prev);
    }

    #[test]
    fn changed_field_yields_diff_only_update() {
        let prev = snapshot(vec![("e1", Record::new().with("stars", 5).with("forks_count", 2))]);
        let out = merger(false)
            .merge(
                &prev,
                &[ok(0, "e1", Record::new().with("stars", 7).with("forks_count", 2))],
            )
            .unwrap();
        assert_eq!(out.events.len(), 1);
        let event = &out.events[0];
        assert_eq!(event.kind, ChangeKind::Updated);
        assert_eq!(event.changed_fields, vec!["stars".to_string()]);
        assert_eq!(event.before, Some(Record::new().with("stars", 5)));
        assert_eq!(event.after, Some(Record::new().with("stars", 7)));
        assert_eq!(event.timestamp, at());
        assert_eq!(
            out.next.get(&Identifier::from("e1")).unwrap().get("stars"),
            &FieldValue::Int(7)
        );
    }

    #[test]
    fn new_identifier_is_added() {
        let out = merger(false)
            .merge(&Snapshot::new(), &[ok(0, "e2", Record::new().with("stars", 1))])
            .unwrap();
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].kind, ChangeKind::Added);
        assert!(out.next.contains(&Identifier::from("e2")));
    }

    #[test]
    fn failed_fetch_carries_previous_record_forward() {
        let prev = snapshot(vec![("e1", Record::new().with("stars", 5))]);
        let out = merger(true).merge(&prev, &[failed(0, "e1")]).unwrap();
        assert!(out.events.is_empty());
        assert_eq!(out.next, prev);
        assert_eq!(out.failed, 1);
    }

    #[test]
    fn absence_removes_only_when_authoritative() {
        let prev = snapshot(vec![
            ("e1", Record::new().with("stars", 5)),
            ("e9", Record::new().with("stars", 1)),
        ]);
        let outcomes = [ok(0, "e1", Record::new().with("stars", 5))];

        let lenient = merger(false).merge(&prev, &outcomes).unwrap();
        assert!(lenient.events.is_empty());
        assert!(lenient.next.contains(&Identifier::from("e9")));

        let strict = merger(true).merge(&prev, &outcomes).unwrap();
        assert_eq!(strict.events.len(), 1);
        assert_eq!(strict.events[0].kind, ChangeKind::Removed);
        assert_eq!(strict.events[0].before, Some(Record::new().with("stars", 1)));
        assert!(!strict.next.contains(&Identifier::from("e9")));
    }

    #[test]
    fn curated_fields_survive_null_fetches() {
        let prev = snapshot(vec![(
            "e1",
            Record::new().with("stars", 5).with("category", "Harvesting"),
        )]);
        let out = merger(false)
            .merge(&prev, &[ok(0, "e1", Record::new().with("stars", 6))])
            .unwrap();
        let next = out.next.get(&Identifier::from("e1")).unwrap();
        assert_eq!(next.get("category"), &FieldValue::text("Harvesting"));
        assert_eq!(out.events[0].changed_fields, vec!["stars".to_string()]);

        let replaced = merger(false)
            .merge(
                &prev,
                &[ok(0, "e1", Record::new().with("stars", 5).with("category", "Spatial"))],
            )
            .unwrap();
        let next = replaced.next.get(&Identifier::from("e1")).unwrap();
        assert_eq!(next.get("category"), &FieldValue::text("Spatial"));
    }

    #[test]
    fn source_owned_null_clears_the_field() {
        let prev = snapshot(vec![("e1", Record::new().with("latest_release", "v1"))]);
        let out = merger(false).merge(&prev, &[ok(0, "e1", Record::new())]).unwrap();
        assert_eq!(out.events[0].changed_fields, vec!["latest_release".to_string()]);
        assert_eq!(out.events[0].after, Some(Record::new()));
        assert!(out.next.get(&Identifier::from("e1")).unwrap().is_empty());
    }

    #[test]
    fn merge_is_idempotent() {
        let prev = snapshot(vec![("e1", Record::new().with("stars", 5).with("notes", "kept"))]);
        let outcomes = [
            ok(0, "e1", Record::new().with("stars", 8)),
            ok(1, "e2", Record::new().with("stars", 2).with("title", "Two")),
        ];
        let first = merger(true).merge(&prev, &outcomes).unwrap();
        let second = merger(true).merge(&first.next, &outcomes).unwrap();
        assert!(second.events.is_empty());
        assert_eq!(second.next, first.next);
    }

    #[test]
    fn outcome_order_does_not_matter() {
        let prev = snapshot(vec![("a", Record::new().with("stars", 1))]);
        let forward = [
            ok(0, "a", Record::new().with("stars", 2)),
            ok(1, "b", Record::new().with("stars", 3)),
        ];
        let reversed = [forward[1].clone(), forward[0].clone()];
        assert_eq!(
            merger(false).merge(&prev, &forward).unwrap(),
            merger(false).merge(&prev, &reversed).unwrap()
        );
    }

    #[test]
    fn duplicate_outcomes_are_rejected() {
        let err = merger(false)
            .merge(&Snapshot::new(), &[ok(0, "a", Record::new()), failed(1, "a")])
            .unwrap_err();
        assert_eq!(err, MergeError::DuplicateIdentifier(Identifier::from("a")));
    }

    #[test]
    fn mistyped_fetch_is_rejected() {
        let err = merger(false)
            .merge(&Snapshot::new(), &[ok(0, "a", Record::new().with("stars", "lots"))])
            .unwrap_err();
        assert!(matches!(err, MergeError::TypeMismatch { .. }));
    }
}
