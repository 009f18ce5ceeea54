//! The Batch Boundary Planner computes one batch boundary per trigger and turns the engine's
//! confirmation into a commit.
//!
//! A cycle moves through [PlannerState]:
//! ```text
//! Idle -> FetchingLatest -> Clamping -> Emitted -> Confirmed -> Committed -> Idle
//! ```
//! Only `FetchingLatest` reacts to cancellation. Once a batch is emitted it has to be either
//! confirmed (and committed) or explicitly abandoned, and no new batch is planned before that.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::ConsumedOffsets;
use crate::error::{Error, Result};
use crate::rate_limit::{RateLimiter, RateSignal};
use crate::retry::{Backoff, retry};
use crate::source::UpstreamSource;
use crate::tracker::ProgressTracker;
use crate::types::{
    BatchId, BatchRecord, CommittedState, FetchedHighest, PartitionId, PartitionOffset,
    PartitionRange,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlannerState {
    Idle,
    FetchingLatest,
    Clamping,
    Emitted,
    Confirmed,
    Committed,
}

#[derive(Debug, Clone)]
pub struct PlannerOptions {
    /// Skips upstream partition discovery when set.
    pub partition_count: Option<u32>,
    /// Bound for every single upstream call.
    pub fetch_timeout: Duration,
    pub fetch_backoff: Backoff,
    pub commit_backoff: Backoff,
    /// Fail instead of starting a newly appeared partition from the start of the stream.
    pub fail_on_missing_starting_offset: bool,
    /// Reject, instead of only logging, consumption reported beyond the planned target.
    pub strict_consumption_check: bool,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            partition_count: None,
            fetch_timeout: Duration::from_secs(5),
            fetch_backoff: Backoff::with_retries(5),
            commit_backoff: Backoff::with_retries(3),
            fail_on_missing_starting_offset: false,
            strict_consumption_check: true,
        }
    }
}

/// A planned batch as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedBatch {
    pub record: BatchRecord,
    pub ranges: Vec<PartitionRange>,
    /// Planned against a horizon from an earlier cycle because the upstream was unavailable.
    pub stale_horizon: bool,
}

impl EmittedBatch {
    pub fn batch_id(&self) -> BatchId {
        self.record.batch_id
    }

    /// Messages planned across all partitions.
    pub fn planned_messages(&self) -> i64 {
        self.ranges.iter().map(PartitionRange::len).sum()
    }
}

pub struct BatchPlanner<S> {
    stream: String,
    source: S,
    tracker: Arc<ProgressTracker>,
    limiter: RateLimiter,
    signal: RateSignal,
    options: PlannerOptions,
    cancel: CancellationToken,
    horizon: Option<FetchedHighest>,
    in_flight: Option<EmittedBatch>,
    state: PlannerState,
    /// Set until recovery established the starting state.
    first_batch: bool,
}

impl<S: UpstreamSource> BatchPlanner<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: impl Into<String>,
        source: S,
        tracker: Arc<ProgressTracker>,
        limiter: RateLimiter,
        signal: RateSignal,
        options: PlannerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream: stream.into(),
            source,
            tracker,
            limiter,
            signal,
            options,
            cancel,
            horizon: None,
            in_flight: None,
            state: PlannerState::Idle,
            first_batch: true,
        }
    }

    pub fn state(&self) -> PlannerState {
        self.state
    }

    pub fn is_first_batch(&self) -> bool {
        self.first_batch
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn horizon(&self) -> Option<&FetchedHighest> {
        self.horizon.as_ref()
    }

    pub fn in_flight(&self) -> Option<&EmittedBatch> {
        self.in_flight.as_ref()
    }

    pub(crate) fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// Called by recovery once the committed state is settled and a fresh horizon is known.
    pub(crate) fn mark_recovered(&mut self, horizon: FetchedHighest) {
        self.horizon = Some(horizon);
        self.first_batch = false;
        self.state = PlannerState::Idle;
    }

    /// Queries the latest position of every partition concurrently. Any failure or timeout fails
    /// the whole fetch; a partial horizon is never returned.
    pub async fn fetch_highest(&self) -> Result<FetchedHighest> {
        let timeout = self.options.fetch_timeout;
        let unavailable = |what: String| Error::SourceUnavailable {
            reason: format!("{what} timed out after {timeout:?}"),
        };

        let count = match self.options.partition_count {
            Some(count) => count,
            None => tokio::time::timeout(timeout, self.source.partition_count(&self.stream))
                .await
                .map_err(|_| unavailable(format!("partition count of {}", self.stream)))??,
        };
        let partitions = PartitionId::all(&self.stream, count);

        let fetches = partitions.iter().map(|partition| async move {
            let position = tokio::time::timeout(timeout, self.source.latest_position(partition))
                .await
                .map_err(|_| unavailable(format!("latest position of {partition}")))??;
            Ok::<_, Error>((partition.clone(), position))
        });

        let positions = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            positions = try_join_all(fetches) => positions?,
        };
        Ok(FetchedHighest::new(positions.into_iter().collect()))
    }

    /// [Self::fetch_highest] with backoff. When the upstream stays unavailable the previous
    /// horizon is reused (`true` in the result); without one there is nothing safe to plan.
    pub(crate) async fn fetch_with_retry(&self) -> Result<(FetchedHighest, bool)> {
        let this = self;
        let fetched = retry(
            self.options.fetch_backoff.clone(),
            &self.cancel,
            "fetch latest positions",
            move || this.fetch_highest(),
        )
        .await;

        match fetched {
            Ok(horizon) => Ok((horizon, false)),
            Err((e, _)) if !e.is_retryable() => Err(e),
            Err((e, attempts)) => match &self.horizon {
                Some(previous) => {
                    warn!(
                        stream = %self.stream,
                        attempts,
                        horizon_age = ?previous.age(),
                        error = %e,
                        "Upstream unavailable, planning against the previous horizon"
                    );
                    Ok((previous.clone(), true))
                }
                None => Err(Error::NoHorizon {
                    stream: self.stream.clone(),
                    reason: e.to_string(),
                }),
            },
        }
    }

    /// Plans the next batch: fetches the horizon, rate limits against the committed state,
    /// clamps to the horizon and emits the boundary. Nothing is persisted here.
    pub async fn plan_next(&mut self) -> Result<EmittedBatch> {
        if self.first_batch {
            return Err(Error::NotRecovered);
        }
        if let Some(in_flight) = &self.in_flight {
            return Err(Error::BatchInFlight(in_flight.batch_id()));
        }

        self.state = PlannerState::FetchingLatest;
        let (horizon, stale_horizon) = match self.fetch_with_retry().await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.state = PlannerState::Idle;
                return Err(e);
            }
        };

        self.state = PlannerState::Clamping;
        let committed = self.tracker.current();
        let emitted = match self.clamp(&committed, &horizon, stale_horizon) {
            Ok(emitted) => emitted,
            Err(e) => {
                self.state = PlannerState::Idle;
                return Err(e);
            }
        };

        info!(
            stream = %self.stream,
            batch_id = emitted.batch_id(),
            planned_messages = emitted.planned_messages(),
            stale_horizon,
            "Emitting batch boundary"
        );
        debug!(targets = ?emitted.record.target_seq_nums, "Batch targets");

        self.horizon = Some(horizon);
        self.in_flight = Some(emitted.clone());
        self.state = PlannerState::Emitted;
        Ok(emitted)
    }

    fn clamp(
        &self,
        committed: &CommittedState,
        horizon: &FetchedHighest,
        stale_horizon: bool,
    ) -> Result<EmittedBatch> {
        let batch_id = committed.next_batch_id();

        let missing: Vec<_> = committed
            .offsets
            .keys()
            .filter(|p| !horizon.positions.contains_key(*p))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(Error::PartitionDrift { batch_id, missing });
        }

        let mut from: BTreeMap<PartitionId, PartitionOffset> = committed.offsets.clone();
        for partition in horizon.positions.keys() {
            if from.contains_key(partition) {
                continue;
            }
            if self.options.fail_on_missing_starting_offset {
                return Err(Error::MissingStartingOffset(partition.clone()));
            }
            info!(%partition, batch_id, "New partition, starting from the start of the stream");
            from.insert(partition.clone(), PartitionOffset::START_OF_STREAM);
        }

        let from_seq_nos: BTreeMap<PartitionId, i64> = from
            .iter()
            .map(|(p, o)| (p.clone(), o.rate_seq_no()))
            .collect();
        let latest = horizon.seq_nos();

        let mut targets = self
            .limiter
            .compute_targets(&from_seq_nos, &latest, self.signal.current());

        // the limiter's view may be optimistic, never step past what the upstream reported
        for (partition, target) in targets.iter_mut() {
            let floor = from_seq_nos.get(partition).map_or(*target, |from| from - 1);
            if let Some(highest) = latest.get(partition) {
                *target = (*target).min(*highest);
            }
            *target = (*target).max(floor);
        }

        // targets are inclusive, ranges end right after them
        let ranges = from
            .iter()
            .map(|(partition, offset)| PartitionRange {
                partition: partition.clone(),
                from: *offset,
                until_seq_no: targets
                    .get(partition)
                    .map_or_else(|| offset.rate_seq_no(), |target| target + 1),
            })
            .collect();

        Ok(EmittedBatch {
            record: BatchRecord::new(batch_id, targets),
            ranges,
            stale_horizon,
        })
    }

    /// Commits what the engine consumed for the in-flight batch. Partitions the engine did not
    /// report keep their previous position. Store failures are retried with backoff; the batch
    /// stays in flight if the commit ultimately fails.
    pub async fn confirm(
        &mut self,
        batch_id: BatchId,
        consumed: ConsumedOffsets,
    ) -> Result<Arc<CommittedState>> {
        let in_flight = match &self.in_flight {
            Some(in_flight) if in_flight.batch_id() == batch_id => in_flight.clone(),
            other => {
                return Err(Error::UnexpectedBatch {
                    expected: other.as_ref().map(EmittedBatch::batch_id),
                    got: batch_id,
                });
            }
        };
        self.state = PlannerState::Confirmed;

        check_consumption(
            &in_flight.record,
            &consumed,
            self.options.strict_consumption_check,
        )?;

        let mut offsets: BTreeMap<PartitionId, PartitionOffset> = in_flight
            .ranges
            .iter()
            .map(|range| (range.partition.clone(), range.from))
            .collect();
        offsets.extend(consumed);

        let committed = commit_with_retry(
            &self.tracker,
            self.options.commit_backoff.clone(),
            batch_id,
            offsets,
        )
        .await?;

        self.state = PlannerState::Committed;
        self.in_flight = None;
        self.state = PlannerState::Idle;
        Ok(committed)
    }

    /// Gives up on the in-flight batch without committing anything. The committed state is
    /// unchanged, so the next plan covers the same batch id again.
    pub fn abandon(&mut self, batch_id: BatchId) -> Result<BatchRecord> {
        match self.in_flight.take() {
            Some(in_flight) if in_flight.batch_id() == batch_id => {
                warn!(stream = %self.stream, batch_id, "Abandoning emitted batch");
                self.state = PlannerState::Idle;
                Ok(in_flight.record)
            }
            other => {
                let expected = other.as_ref().map(EmittedBatch::batch_id);
                self.in_flight = other;
                Err(Error::UnexpectedBatch {
                    expected,
                    got: batch_id,
                })
            }
        }
    }
}

/// Engine reports are trusted only up to the planned target: a consumed position, being the next
/// message to read, may be at most one past it. Every reported partition must be part of the plan.
pub(crate) fn check_consumption(
    record: &BatchRecord,
    consumed: &ConsumedOffsets,
    strict: bool,
) -> Result<()> {
    for (partition, offset) in consumed {
        let Some(planned) = record.target_seq_nums.get(partition) else {
            return Err(Error::Invariant {
                batch_id: record.batch_id,
                detail: format!("engine reported {partition} which was not part of the plan"),
            });
        };
        if offset.seq_no > planned.saturating_add(1) {
            if strict {
                return Err(Error::OverReported {
                    batch_id: record.batch_id,
                    partition: partition.clone(),
                    consumed: offset.seq_no,
                    planned: *planned,
                });
            }
            warn!(
                batch_id = record.batch_id,
                %partition,
                consumed = offset.seq_no,
                planned,
                "Engine reported consumption beyond the plan"
            );
        }
    }
    Ok(())
}

/// Commits through `tracker`, retrying retryable failures. Commits are never cancelled midway.
pub(crate) async fn commit_with_retry(
    tracker: &Arc<ProgressTracker>,
    backoff: Backoff,
    batch_id: BatchId,
    offsets: BTreeMap<PartitionId, PartitionOffset>,
) -> Result<Arc<CommittedState>> {
    let never = CancellationToken::new();
    let offsets = &offsets;
    retry(backoff, &never, "commit progress", move || {
        tracker.commit(batch_id, offsets.clone())
    })
    .await
    .map_err(|(e, attempts)| {
        if e.is_retryable() {
            Error::CommitExhausted {
                batch_id,
                attempts,
                last: Box::new(e),
            }
        } else {
            e
        }
    })
}
