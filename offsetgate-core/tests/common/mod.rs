#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use offsetgate_core::planner::{BatchPlanner, PlannerOptions};
use offsetgate_core::rate_limit::{RateLimiter, RateSignal};
use offsetgate_core::retry::Backoff;
use offsetgate_core::runner::Runner;
use offsetgate_core::tracker::{ProgressTracker, TrackerOptions};
use offsetgate_core::types::PartitionId;
use offsetgate_testing::flakystore::FlakyStore;
use offsetgate_testing::simengine::SimulatedEngine;
use offsetgate_testing::simsource::SimulatedSource;

pub const STREAM: &str = "telemetry";
pub const STREAM_UID: &str = "$Default_telemetry_0";

/// Collaborators that outlive a single runner, so a test can "restart" the process by building
/// another runner over the same log, checkpoint and store.
pub struct Harness {
    pub source: SimulatedSource,
    pub engine: SimulatedEngine,
    pub store: FlakyStore,
    pub signal: RateSignal,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(partitions: u32) -> Self {
        Self {
            source: SimulatedSource::new(STREAM, partitions),
            engine: SimulatedEngine::new(),
            store: FlakyStore::new(),
            signal: RateSignal::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub async fn runner(&self, cap: i64) -> Runner<SimulatedSource, SimulatedEngine> {
        self.runner_with(cap, TrackerOptions::default(), planner_options()).await
    }

    pub async fn runner_with(
        &self,
        cap: i64,
        tracker_options: TrackerOptions,
        planner_options: PlannerOptions,
    ) -> Runner<SimulatedSource, SimulatedEngine> {
        let tracker = ProgressTracker::open(
            STREAM_UID,
            Arc::new(self.store.clone()),
            &PartitionId::all(STREAM, self.source.partitions()),
            tracker_options,
        )
        .await
        .unwrap();

        let planner = BatchPlanner::new(
            STREAM,
            self.source.clone(),
            Arc::new(tracker),
            RateLimiter::new(cap).unwrap(),
            self.signal.clone(),
            planner_options,
            self.cancel.clone(),
        );
        Runner::new(planner, self.engine.clone(), self.cancel.clone())
    }
}

/// Millisecond backoffs, two retries each.
pub fn planner_options() -> PlannerOptions {
    PlannerOptions {
        fetch_timeout: Duration::from_millis(200),
        fetch_backoff: Backoff::fixed_factor(Duration::from_millis(1), 2),
        commit_backoff: Backoff::fixed_factor(Duration::from_millis(1), 2),
        ..Default::default()
    }
}

pub fn seq_of(runner: &Runner<SimulatedSource, SimulatedEngine>, index: u32) -> i64 {
    runner
        .planner()
        .tracker()
        .current()
        .offsets
        .get(&PartitionId::new(STREAM, index))
        .map(|offset| offset.seq_no)
        .unwrap_or(i64::MIN)
}
