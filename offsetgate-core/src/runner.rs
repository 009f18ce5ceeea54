//! The outer loop: recover once, then on every trigger plan a batch, let the engine execute it
//! and commit what it consumed.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{BatchExecutor, EngineCheckpoint};
use crate::error::{Error, Result};
use crate::planner::BatchPlanner;
use crate::recovery::{RecoveryCoordinator, RecoveryOutcome};
use crate::source::UpstreamSource;
use crate::types::{BatchId, CommittedState};

/// What one completed cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub batch_id: BatchId,
    pub planned_messages: i64,
    pub stale_horizon: bool,
    pub committed: Arc<CommittedState>,
}

pub struct Runner<S, E> {
    planner: BatchPlanner<S>,
    engine: E,
    cancel: CancellationToken,
    recovered: Option<RecoveryOutcome>,
}

impl<S, E> Runner<S, E>
where
    S: UpstreamSource,
    E: EngineCheckpoint + BatchExecutor,
{
    pub fn new(planner: BatchPlanner<S>, engine: E, cancel: CancellationToken) -> Self {
        Self {
            planner,
            engine,
            cancel,
            recovered: None,
        }
    }

    pub fn planner(&self) -> &BatchPlanner<S> {
        &self.planner
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs recovery if it has not completed yet.
    pub async fn recover(&mut self) -> Result<RecoveryOutcome> {
        if let Some(outcome) = self.recovered {
            return Ok(outcome);
        }
        let outcome = RecoveryCoordinator::new(&self.engine)
            .recover(&mut self.planner)
            .await?;
        self.recovered = Some(outcome);
        Ok(outcome)
    }

    /// One plan, execute, confirm round trip. An engine failure abandons the batch so the next
    /// cycle plans the same batch id again against a fresh horizon.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let emitted = self.planner.plan_next().await?;
        let batch_id = emitted.batch_id();

        let consumed = match self.engine.execute(&emitted.record, &emitted.ranges).await {
            Ok(consumed) => consumed,
            Err(e) => {
                self.planner.abandon(batch_id)?;
                return Err(e);
            }
        };

        let committed = self.planner.confirm(batch_id, consumed).await?;
        Ok(CycleReport {
            batch_id,
            planned_messages: emitted.planned_messages(),
            stale_horizon: emitted.stale_horizon,
            committed,
        })
    }

    /// Recovers, then runs one cycle per item of `triggers` until the triggers end or the runner
    /// is cancelled. Cancellation is honored between cycles and while fetching the horizon, never
    /// between emitting a batch and committing it.
    pub async fn run<T>(&mut self, mut triggers: T) -> Result<()>
    where
        T: Stream + Unpin,
    {
        let outcome = self.recover().await?;
        info!(
            ?outcome,
            recovered_batch_id = outcome.recovered_batch_id(),
            "Runner started"
        );

        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                trigger = triggers.next() => trigger,
            };
            if trigger.is_none() {
                break;
            }

            match self.run_cycle().await {
                Ok(report) => info!(
                    batch_id = report.batch_id,
                    planned_messages = report.planned_messages,
                    stale_horizon = report.stale_horizon,
                    "Batch committed"
                ),
                Err(Error::Cancelled) => break,
                Err(e @ Error::Executor(_)) => {
                    warn!(error = %e, "Engine failed the batch, it will be planned again");
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Cycle failed, retrying on the next trigger");
                }
                Err(e) => {
                    error!(error = %e, "Fatal error, stopping the runner");
                    return Err(e);
                }
            }
        }

        info!(
            committed_batch_id = self.planner.tracker().current().batch_id,
            "Runner stopped"
        );
        Ok(())
    }
}
