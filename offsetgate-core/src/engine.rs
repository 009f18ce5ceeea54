//! Seams to the batch-processing engine that executes planned ranges.

use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::{BatchRecord, PartitionId, PartitionOffset, PartitionRange};

/// Per partition, the next position to read: right after the last message the engine consumed.
pub type ConsumedOffsets = BTreeMap<PartitionId, PartitionOffset>;

/// Markers the engine keeps in its own checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineMarkers {
    /// The last boundary handed to the engine. [BatchRecord::bootstrap] if no real batch ever
    /// started.
    pub start: BatchRecord,
    /// What the engine consumed of `start`, present once it recorded its end marker.
    pub consumed: Option<ConsumedOffsets>,
}

/// Read access to the engine's checkpoint, used once at startup.
#[trait_variant::make(Send)]
pub trait EngineCheckpoint: Sync {
    /// `None` when the engine has never checkpointed anything for this stream.
    async fn last_markers(&self) -> Result<Option<EngineMarkers>>;
}

/// Runs one planned batch to completion.
#[trait_variant::make(Send)]
pub trait BatchExecutor: Sync {
    /// Consumes `ranges` of `batch` and reports what was actually consumed, which may stop short
    /// of the plan. The engine records its own start/end markers as it goes.
    async fn execute(&self, batch: &BatchRecord, ranges: &[PartitionRange])
    -> Result<ConsumedOffsets>;
}
