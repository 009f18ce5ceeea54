use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use offsetgate_core::engine::{BatchExecutor, ConsumedOffsets, EngineCheckpoint, EngineMarkers};
use offsetgate_core::types::{BatchId, BatchRecord, PartitionRange};

use super::error_injector::EngineErrorInjector;
use crate::error::SimulationError;
use crate::simsource::position_of;

/// One execution the engine completed, end marker included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedBatch {
    pub batch_id: BatchId,
    pub consumed_messages: i64,
    pub consumed: ConsumedOffsets,
}

#[derive(Debug, Default)]
struct EngineState {
    markers: Option<EngineMarkers>,
    executed: Vec<ExecutedBatch>,
}

/// Cloning shares the checkpoint, so a clone handed to a restarted runner sees the markers the
/// previous one left behind.
#[derive(Debug, Clone, Default)]
pub struct SimulatedEngine {
    state: Arc<Mutex<EngineState>>,
    injector: Arc<EngineErrorInjector>,
}

impl SimulatedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose checkpoint already holds `markers`.
    pub fn with_markers(markers: EngineMarkers) -> Self {
        let engine = Self::new();
        engine.set_markers(markers);
        engine
    }

    /// Overwrites the checkpoint, as if the engine had just restored it from elsewhere.
    pub fn set_markers(&self, markers: EngineMarkers) {
        self.state.lock().markers = Some(markers);
    }

    pub fn error_injector(&self) -> &EngineErrorInjector {
        &self.injector
    }

    pub fn markers(&self) -> Option<EngineMarkers> {
        self.state.lock().markers.clone()
    }

    pub fn executed(&self) -> Vec<ExecutedBatch> {
        self.state.lock().executed.clone()
    }

    /// Messages consumed over all completed executions.
    pub fn consumed_messages(&self) -> i64 {
        self.state
            .lock()
            .executed
            .iter()
            .map(|batch| batch.consumed_messages)
            .sum()
    }

    fn consume(&self, ranges: &[PartitionRange]) -> (ConsumedOffsets, i64) {
        let percent = self.injector.percent();
        let extra = self.injector.extra();
        let mut consumed = ConsumedOffsets::new();
        let mut messages = 0;

        for range in ranges.iter().filter(|range| !range.is_empty()) {
            let take = range.len() * percent / 100;
            if take == 0 && extra == 0 {
                continue;
            }
            let until = range.from.rate_seq_no() + take;
            consumed.insert(range.partition.clone(), position_of(until + extra));
            messages += take;
        }
        (consumed, messages)
    }
}

impl EngineCheckpoint for SimulatedEngine {
    async fn last_markers(&self) -> offsetgate_core::Result<Option<EngineMarkers>> {
        Ok(self.markers())
    }
}

impl BatchExecutor for SimulatedEngine {
    async fn execute(
        &self,
        batch: &BatchRecord,
        ranges: &[PartitionRange],
    ) -> offsetgate_core::Result<ConsumedOffsets> {
        self.state.lock().markers = Some(EngineMarkers {
            start: batch.clone(),
            consumed: None,
        });
        self.injector.apply_latency().await;

        if self.injector.should_crash_before_end() {
            return Err(SimulationError::Crashed(format!(
                "batch {} started but never finished",
                batch.batch_id
            ))
            .into());
        }

        let (consumed, messages) = self.consume(ranges);
        {
            let mut state = self.state.lock();
            state.markers = Some(EngineMarkers {
                start: batch.clone(),
                consumed: Some(consumed.clone()),
            });
            state.executed.push(ExecutedBatch {
                batch_id: batch.batch_id,
                consumed_messages: messages,
                consumed: consumed.clone(),
            });
        }
        debug!(batch_id = batch.batch_id, messages, "Simulated batch executed");

        if self.injector.should_crash_after_end() {
            return Err(SimulationError::Crashed(format!(
                "batch {} finished but the commit was lost",
                batch.batch_id
            ))
            .into());
        }
        Ok(consumed)
    }
}
