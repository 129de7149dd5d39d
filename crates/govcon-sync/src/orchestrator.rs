//! Bounded-concurrency fan-out of partition fetches for one adapter.

use std::sync::Arc;

use govcon_adapters::{AdapterContext, RawRecord, SourceAdapter};
use govcon_core::PartitionKey;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub const DEADLINE_EXCEEDED: &str = "deadline exceeded before dispatch";

/// Result of fetching one partition. A failed partition carries no records.
#[derive(Debug, Clone)]
pub struct PartitionOutcome {
    pub partition: PartitionKey,
    pub records: Vec<RawRecord>,
    pub failure: Option<String>,
}

impl PartitionOutcome {
    fn succeeded(partition: PartitionKey, records: Vec<RawRecord>) -> Self {
        Self {
            partition,
            records,
            failure: None,
        }
    }

    fn failed(partition: PartitionKey, reason: impl Into<String>) -> Self {
        Self {
            partition,
            records: Vec::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Faults in the orchestration machinery itself. These abort the run.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("partition task could not be joined: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("fetch worker pool closed")]
    PoolClosed,
}

#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    concurrency: usize,
    deadline: Option<Instant>,
}

impl FetchOrchestrator {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            deadline: None,
        }
    }

    /// Partitions that have not started fetching by `deadline` are reported as
    /// failed. Fetches already in flight run to completion.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Fetches every partition and returns one outcome per partition, in
    /// completion order.
    pub async fn fetch_all(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        ctx: &AdapterContext,
        partitions: Vec<PartitionKey>,
    ) -> Result<Vec<PartitionOutcome>, OrchestrationError> {
        let workers = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<Result<PartitionOutcome, OrchestrationError>> = JoinSet::new();

        for partition in partitions {
            let workers = workers.clone();
            let adapter = adapter.clone();
            let ctx = ctx.clone();
            let deadline = self.deadline;
            let span = info_span!(
                "partition_fetch",
                source_id = adapter.source_id(),
                partition = %partition
            );

            tasks.spawn(
                async move {
                    let _permit = workers
                        .acquire_owned()
                        .await
                        .map_err(|_| OrchestrationError::PoolClosed)?;

                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        warn!("run deadline passed; partition not fetched");
                        return Ok(PartitionOutcome::failed(partition, DEADLINE_EXCEEDED));
                    }

                    match adapter.fetch(&ctx, &partition).await {
                        Ok(records) => {
                            debug!(records = records.len(), "partition fetched");
                            Ok(PartitionOutcome::succeeded(partition, records))
                        }
                        Err(err) => {
                            warn!(
                                error = %err,
                                auth = err.is_auth(),
                                rate_limited = err.is_rate_limited(),
                                "partition fetch failed; continuing with remaining partitions"
                            );
                            Ok(PartitionOutcome::failed(partition, err.to_string()))
                        }
                    }
                }
                .instrument(span),
            );
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            outcomes.push(joined??);
        }
        Ok(outcomes)
    }
}
