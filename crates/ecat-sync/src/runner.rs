//! Sequences fetch, merge and publish for one dataset run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use ecat_core::{ChangeEvent, Identifier, RunState, RunSummary, Schema};
use ecat_sources::RecordSource;
use ecat_storage::RunArchive;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::SyncConfig;
use crate::merge::{MergePolicy, Merger};
use crate::publish::Publisher;
use crate::snapshot::{dedupe_events, SnapshotStore};

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub concurrency: usize,
    pub per_call_timeout: Duration,
    pub authoritative_for_absence: bool,
}

impl From<&SyncConfig> for RunSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            per_call_timeout: config.per_call_timeout,
            authoritative_for_absence: config.authoritative_for_absence,
        }
    }
}

struct RunTracker {
    summary: RunSummary,
}

impl RunTracker {
    fn state(&self) -> RunState {
        self.summary.final_state
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state().can_transition_to(next),
            "illegal run transition {:?} -> {next:?}",
            self.state()
        );
        info!(from = ?self.state(), to = ?next, "run state");
        self.summary.final_state = next;
    }

    fn abort(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(state = ?self.state(), reason = %reason, "run aborted");
        self.advance(RunState::Aborted);
        self.summary.error = Some(reason);
    }
}

pub struct PipelineRunner {
    dataset_id: String,
    schema: Schema,
    source: RecordSource,
    catalog: Arc<dyn Catalog>,
    store: SnapshotStore,
    publisher: Publisher,
    archive: RunArchive,
    settings: RunSettings,
    cancel: CancellationToken,
}

impl PipelineRunner {
    pub fn new(
        dataset_id: impl Into<String>,
        schema: Schema,
        source: RecordSource,
        catalog: Arc<dyn Catalog>,
        archive: RunArchive,
        settings: RunSettings,
    ) -> Self {
        let dataset_id = dataset_id.into();
        Self {
            store: SnapshotStore::new(catalog.clone()),
            publisher: Publisher::new(catalog.clone(), dataset_id.clone()),
            catalog,
            dataset_id,
            schema,
            source,
            archive,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancellation is honoured until publishing starts.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.source = self.source.with_cancellation(cancel.clone());
        self.cancel = cancel;
        self
    }

    /// Always reaches a terminal state; failures are reported in the summary.
    pub async fn run(&self, identifiers: Vec<Identifier>) -> RunSummary {
        let run_id = Uuid::new_v4();
        // event rows store whole seconds; keep the run stamp comparable with them
        let started_at = Utc::now().trunc_subsecs(0);
        let span = info_span!("run", %run_id, dataset_id = %self.dataset_id);
        async move {
            let mut run = RunTracker {
                summary: RunSummary::new(run_id, self.dataset_id.clone(), started_at),
            };
            let events = self.drive(&mut run, identifiers).await;
            run.summary.finished_at = Utc::now();

            match self
                .archive
                .write_run(started_at, &self.dataset_id, run_id, &run.summary, &events)
                .await
            {
                Ok(stored) => info!(
                    dir = %stored.run_dir.display(),
                    sha256 = %stored.summary_sha256,
                    "run archived"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "archiving run failed"),
            }
            info!(
                state = ?run.summary.final_state,
                added = run.summary.added,
                updated = run.summary.updated,
                removed = run.summary.removed,
                failed = run.summary.failed,
                "run finished"
            );
            run.summary
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, run: &mut RunTracker, identifiers: Vec<Identifier>) -> Vec<ChangeEvent> {
        match self.archive.halt_reason(&self.dataset_id).await {
            Ok(Some(reason)) => {
                run.summary.requires_intervention = true;
                run.abort(format!("dataset is halted: {}", reason.trim()));
                return Vec::new();
            }
            Ok(None) => {}
            Err(err) => {
                run.abort(format!("{err:#}"));
                return Vec::new();
            }
        }

        let identifiers = unique_in_order(identifiers);
        run.summary.requested = identifiers.len();
        if identifiers.is_empty() {
            run.abort("identifier list is empty");
            return Vec::new();
        }

        if let Err(err) = self.catalog.check_connection().await {
            run.abort(format!("catalog unreachable: {err}"));
            return Vec::new();
        }

        let previous = match self.store.load(&self.dataset_id, &self.schema).await {
            Ok(previous) => previous,
            Err(err) => {
                run.abort(format!("loading previous state: {err}"));
                return Vec::new();
            }
        };
        if self.cancel.is_cancelled() {
            run.abort("cancelled before fetching");
            return Vec::new();
        }

        run.advance(RunState::Fetching);
        let outcomes = self
            .source
            .fetch_all(
                &identifiers,
                self.settings.concurrency,
                self.settings.per_call_timeout,
            )
            .await;
        run.summary.failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if self.cancel.is_cancelled() {
            run.abort("cancelled while fetching");
            return Vec::new();
        }

        run.advance(RunState::Merging);
        let merger = Merger::new(
            self.schema.clone(),
            MergePolicy {
                authoritative_for_absence: self.settings.authoritative_for_absence,
                observed_at: run.summary.started_at,
            },
        );
        let output = match merger.merge(&previous.snapshot, &outcomes) {
            Ok(output) => output,
            Err(err) => {
                run.abort(format!("merge inconsistency: {err}"));
                return Vec::new();
            }
        };
        let events = dedupe_events(output.events, &previous.log);
        run.summary.count_events(&events);

        run.advance(RunState::Publishing);
        let result = self
            .publisher
            .publish(&output.next, &events, &previous.snapshot)
            .await;
        run.summary.applied = result.applied_count;
        run.summary.rolled_back = result.rolled_back;

        match result.error {
            None => run.advance(RunState::Succeeded),
            Some(err) if err.is_fatal() => {
                error!(error = %err, "fatal inconsistency, halting dataset");
                run.summary.requires_intervention = true;
                if let Err(marker_err) = self
                    .archive
                    .write_halt_marker(&self.dataset_id, &err.to_string())
                    .await
                {
                    error!(error = %format!("{marker_err:#}"), "writing halt marker failed");
                }
                run.abort(err.to_string());
            }
            Some(err) if result.rolled_back => {
                run.advance(RunState::PartiallyFailed);
                run.summary.error = Some(err.to_string());
            }
            Some(err) => run.abort(err.to_string()),
        }
        events
    }
}

fn unique_in_order(identifiers: Vec<Identifier>) -> Vec<Identifier> {
    let mut seen = HashSet::new();
    identifiers
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}
