//! Reconciles the engine's checkpoint markers with the tracker's snapshots on startup, before the
//! first batch is planned.
//!
//! | engine start marker | tracker newest | outcome                                   |
//! |---------------------|----------------|-------------------------------------------|
//! | none                | none           | cold start                                |
//! | bootstrap (`-1`)    | none           | cold start, nothing committed             |
//! | `n`                 | `n`            | resume from the tracker                   |
//! | `n`, end marker     | `n - 1`        | commit the engine's end marker as `n`     |
//! | `n`, no end marker  | `n - 1`        | resume from the tracker, replan `n`       |
//! | anything else       |                | [Error::RecoveryAmbiguity], fatal         |
//!
//! ("none" for the tracker means it is still in its initial state.) A batch the engine started
//! but never finished was not confirmed, so whatever it read is read again.


use tracing::{info, warn};

use crate::engine::{EngineCheckpoint, EngineMarkers};
use crate::error::{Error, Result};
use crate::planner::{BatchPlanner, check_consumption, commit_with_retry};
use crate::source::UpstreamSource;
use crate::types::{BatchId, INITIAL_BATCH_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Neither side knows about any batch.
    ColdStart,
    /// The engine only carries the bootstrap marker; nothing is committed on its behalf.
    Bootstrap,
    /// Planning continues after this committed batch. Either the engine last started it, or
    /// the engine started the next one and never finished it.
    Resumed(BatchId),
    /// The engine finished a batch whose commit never happened; it is committed now.
    CommittedOnBehalf(BatchId),
}

impl RecoveryOutcome {
    /// Batch id recovery settled on, `-1` when there was none.
    pub fn recovered_batch_id(&self) -> BatchId {
        match self {
            RecoveryOutcome::ColdStart | RecoveryOutcome::Bootstrap => INITIAL_BATCH_ID,
            RecoveryOutcome::Resumed(id) | RecoveryOutcome::CommittedOnBehalf(id) => *id,
        }
    }
}

pub struct RecoveryCoordinator<'a, E> {
    engine: &'a E,
}

impl<'a, E: EngineCheckpoint> RecoveryCoordinator<'a, E> {
    pub fn new(engine: &'a E) -> Self {
        Self { engine }
    }

    /// Settles the committed state the planner starts from, then fetches a fresh horizon and
    /// unlocks planning. Any disagreement the table above does not cover is fatal.
    pub async fn recover<S: UpstreamSource>(
        &self,
        planner: &mut BatchPlanner<S>,
    ) -> Result<RecoveryOutcome> {
        let markers = self.engine.last_markers().await?;
        let outcome = self.reconcile(planner, markers).await?;

        let (horizon, _) = planner.fetch_with_retry().await?;
        info!(
            ?outcome,
            committed_batch_id = planner.tracker().current().batch_id,
            partitions = horizon.positions.len(),
            "Recovery complete"
        );
        planner.mark_recovered(horizon);
        Ok(outcome)
    }

    async fn reconcile<S: UpstreamSource>(
        &self,
        planner: &BatchPlanner<S>,
        markers: Option<EngineMarkers>,
    ) -> Result<RecoveryOutcome> {
        let tracker = planner.tracker();
        let current = tracker.current();
        let tracker_batch_id = (!current.is_initial()).then_some(current.batch_id);

        let ambiguity = |engine_batch_id: BatchId, detail: &str| Error::RecoveryAmbiguity {
            engine_batch_id,
            tracker_batch_id,
            detail: detail.to_string(),
        };

        let Some(markers) = markers else {
            if tracker_batch_id.is_some() {
                return Err(ambiguity(
                    INITIAL_BATCH_ID,
                    "engine has no checkpoint but progress was committed",
                ));
            }
            info!("No engine checkpoint, cold start");
            return Ok(RecoveryOutcome::ColdStart);
        };

        if markers.start.is_bootstrap() {
            if tracker_batch_id.is_some() {
                return Err(ambiguity(
                    INITIAL_BATCH_ID,
                    "engine only saw the bootstrap batch but progress was committed",
                ));
            }
            info!("Engine checkpoint holds only the bootstrap batch");
            return Ok(RecoveryOutcome::Bootstrap);
        }

        let engine_batch_id = markers.start.batch_id;
        if let Some(tracker_batch_id) = tracker_batch_id
            && tracker_batch_id > engine_batch_id
        {
            return Err(ambiguity(engine_batch_id, "tracker is ahead of the engine"));
        }

        match tracker.read(engine_batch_id, false).await {
            Ok(_) => {
                info!(batch_id = engine_batch_id, "Resuming from committed progress");
                return Ok(RecoveryOutcome::Resumed(engine_batch_id));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        if current.next_batch_id() != engine_batch_id {
            return Err(ambiguity(
                engine_batch_id,
                "engine started a batch that does not follow the committed one",
            ));
        }
        let Some(consumed) = markers.consumed else {
            warn!(
                batch_id = engine_batch_id,
                committed_batch_id = current.batch_id,
                "Engine started a batch without finishing it, it will be planned again"
            );
            return Ok(RecoveryOutcome::Resumed(current.batch_id));
        };

        check_consumption(
            &markers.start,
            &consumed,
            planner.options().strict_consumption_check,
        )?;

        let mut offsets = current.offsets.clone();
        offsets.extend(consumed);
        warn!(
            batch_id = engine_batch_id,
            partitions = offsets.len(),
            "Engine finished a batch that was never committed, committing it now"
        );
        commit_with_retry(
            tracker,
            planner.options().commit_backoff.clone(),
            engine_batch_id,
            offsets,
        )
        .await?;
        Ok(RecoveryOutcome::CommittedOnBehalf(engine_batch_id))
    }
}
