//! Run coordinator: fetch, normalize at fan-in, reconcile, and report counts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use govcon_adapters::{AdapterContext, SourceAdapter};
use govcon_core::IngestionRunResult;
use govcon_storage::OpportunityStore;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::orchestrator::{FetchOrchestrator, OrchestrationError};
use crate::reconcile::Reconciler;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("no adapter registered for source {0}")]
    UnknownSource(String),
    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterStatus {
    pub source_id: String,
    pub state: RunState,
    pub active_runs: usize,
    pub last_result: Option<IngestionRunResult>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl AdapterStatus {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            state: RunState::NotStarted,
            active_runs: 0,
            last_result: None,
            last_completed_at: None,
            last_error: None,
        }
    }
}

pub struct IngestionCoordinator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    orchestrator: FetchOrchestrator,
    reconciler: Reconciler,
    run_timeout: Option<Duration>,
    statuses: Mutex<BTreeMap<String, AdapterStatus>>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn OpportunityStore>, orchestrator: FetchOrchestrator) -> Self {
        Self {
            adapters: Vec::new(),
            orchestrator,
            reconciler: Reconciler::new(store),
            run_timeout: None,
            statuses: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn SourceAdapter>) -> Self {
        let source_id = adapter.source_id().to_string();
        self.statuses
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(source_id.clone(), AdapterStatus::new(&source_id));
        self.adapters.push(adapter);
        self
    }

    /// Partitions not yet dispatched `timeout` after a run starts are reported
    /// as failed instead of fetched.
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    pub fn source_ids(&self) -> Vec<String> {
        self.adapters
            .iter()
            .map(|adapter| adapter.source_id().to_string())
            .collect()
    }

    pub fn statuses(&self) -> Vec<AdapterStatus> {
        self.lock_statuses().values().cloned().collect()
    }

    pub fn status(&self, source_id: &str) -> Option<AdapterStatus> {
        self.lock_statuses().get(source_id).cloned()
    }

    pub async fn run_for_adapter(&self, source_id: &str) -> Result<IngestionRunResult, IngestError> {
        let adapter = self
            .adapters
            .iter()
            .find(|adapter| adapter.source_id() == source_id)
            .cloned()
            .ok_or_else(|| IngestError::UnknownSource(source_id.to_string()))?;
        self.run_adapter(adapter).await
    }

    /// Runs every registered adapter concurrently. Counts are summed; the
    /// duration is the wall-clock time of the whole composite run. All runs
    /// settle before the first orchestration fault is returned.
    pub async fn run_all(&self) -> Result<IngestionRunResult, IngestError> {
        let clock = Instant::now();
        let runs = self
            .adapters
            .iter()
            .map(|adapter| self.run_adapter(adapter.clone()));

        let mut total = IngestionRunResult::default();
        let mut first_error = None;
        for outcome in join_all(runs).await {
            match outcome {
                Ok(result) => total.absorb(&result),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }

        total.duration_ms = elapsed_ms(clock);
        info!(
            adapters = self.adapters.len(),
            new = total.new_count,
            updated = total.updated_count,
            skipped = total.skipped_count,
            failed_partitions = total.failed_partitions,
            duration_ms = total.duration_ms,
            "ingest run_all completed"
        );
        Ok(total)
    }

    pub async fn run_adapter(
        &self,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<IngestionRunResult, IngestError> {
        let run_id = Uuid::new_v4();
        let source_id = adapter.source_id().to_string();
        let span = info_span!("ingest_run", %run_id, source_id = %source_id);
        self.execute(run_id, &source_id, adapter).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        source_id: &str,
        adapter: Arc<dyn SourceAdapter>,
    ) -> Result<IngestionRunResult, IngestError> {
        let clock = Instant::now();
        let ctx = AdapterContext::new(run_id);
        let partitions = adapter.list_partitions();
        let run = RunGuard::start(self, source_id);
        info!(partitions = partitions.len(), "ingest run started");

        let orchestrator = match self.run_timeout {
            Some(timeout) => self.orchestrator.clone().with_deadline(clock + timeout),
            None => self.orchestrator.clone(),
        };
        let outcomes = match orchestrator.fetch_all(adapter, &ctx, partitions).await {
            Ok(outcomes) => outcomes,
            Err(err) => {
                error!(error = %err, "ingest run aborted");
                run.finish(Err(err.to_string()));
                return Err(err.into());
            }
        };

        let mut result = IngestionRunResult::default();
        for outcome in outcomes {
            if outcome.is_failure() {
                result.failed_partitions += 1;
                continue;
            }
            let observed_at = Utc::now();
            for record in &outcome.records {
                let candidate = record.to_candidate(observed_at);
                result.record(self.reconciler.reconcile(&candidate).await);
            }
        }
        result.duration_ms = elapsed_ms(clock);

        info!(
            new = result.new_count,
            updated = result.updated_count,
            skipped = result.skipped_count,
            failed_partitions = result.failed_partitions,
            duration_ms = result.duration_ms,
            "ingest run completed"
        );
        run.finish(Ok(result));
        Ok(result)
    }

    fn lock_statuses(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, AdapterStatus>> {
        self.statuses.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_started(&self, source_id: &str) {
        let mut statuses = self.lock_statuses();
        let status = statuses
            .entry(source_id.to_string())
            .or_insert_with(|| AdapterStatus::new(source_id));
        status.active_runs += 1;
        status.state = RunState::Running;
    }

    fn mark_finished(&self, source_id: &str, outcome: Result<IngestionRunResult, String>) {
        let mut statuses = self.lock_statuses();
        let Some(status) = statuses.get_mut(source_id) else {
            return;
        };
        status.active_runs = status.active_runs.saturating_sub(1);
        match outcome {
            Ok(result) => {
                status.last_result = Some(result);
                status.last_completed_at = Some(Utc::now());
                status.last_error = None;
            }
            Err(message) => status.last_error = Some(message),
        }
        if status.active_runs == 0 {
            status.state = if status.last_result.is_some() {
                RunState::Completed
            } else {
                RunState::NotStarted
            };
        }
    }
}

pub const RUN_CANCELLED: &str = "run cancelled before completion";

/// Marks an adapter run as active for as long as it lives. A run whose future
/// is dropped before `finish` is recorded as cancelled.
struct RunGuard<'a> {
    coordinator: &'a IngestionCoordinator,
    source_id: String,
    finished: bool,
}

impl<'a> RunGuard<'a> {
    fn start(coordinator: &'a IngestionCoordinator, source_id: &str) -> Self {
        coordinator.mark_started(source_id);
        Self {
            coordinator,
            source_id: source_id.to_string(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: Result<IngestionRunResult, String>) {
        self.finished = true;
        self.coordinator.mark_finished(&self.source_id, outcome);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(source_id = %self.source_id, "ingest run cancelled");
            self.coordinator
                .mark_finished(&self.source_id, Err(RUN_CANCELLED.to_string()));
        }
    }
}

fn elapsed_ms(clock: Instant) -> u64 {
    u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX)
}
