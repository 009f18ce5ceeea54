use std::time::Duration;

use thiserror::Error;

use crate::types::{BatchId, PartitionId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Serde Error - {0}")]
    Serde(String),

    /// The upstream could not answer a latest-position query (unreachable or timed out).
    #[error("Source Error - upstream unavailable: {reason}")]
    SourceUnavailable { reason: String },

    /// The upstream stayed unavailable and there is no earlier horizon to fall back on.
    #[error("Source Error - no horizon to plan against for stream {stream}: {reason}")]
    NoHorizon { stream: String, reason: String },

    #[error("Invariant violated at batch {batch_id}: {detail}")]
    Invariant { batch_id: BatchId, detail: String },

    #[error("Partition set shrank at batch {batch_id}, missing partitions: {missing:?}")]
    PartitionDrift {
        batch_id: BatchId,
        missing: Vec<PartitionId>,
    },

    #[error(
        "Recovery is ambiguous (engine batch {engine_batch_id}, tracker batch {tracker_batch_id:?}): {detail}"
    )]
    RecoveryAmbiguity {
        engine_batch_id: BatchId,
        tracker_batch_id: Option<BatchId>,
        detail: String,
    },

    #[error("No committed snapshot for batch {0}")]
    NotFound(BatchId),

    #[error("Commit of batch {batch_id} did not finish within {timeout:?}")]
    CommitTimeout { batch_id: BatchId, timeout: Duration },

    #[error("Another commit is already running (requested batch {0})")]
    CommitInProgress(BatchId),

    #[error("Commit of batch {batch_id} failed after {attempts} attempts, last error: {last}")]
    CommitExhausted {
        batch_id: BatchId,
        attempts: usize,
        last: Box<Error>,
    },

    #[error("Batch {0} was emitted and is not confirmed yet")]
    BatchInFlight(BatchId),

    #[error("Unexpected batch, expected {expected:?}, got {got}")]
    UnexpectedBatch { expected: Option<BatchId>, got: BatchId },

    #[error(
        "Engine reported consumption beyond the plan at batch {batch_id} for {partition}: consumed up to {consumed}, planned through {planned}"
    )]
    OverReported {
        batch_id: BatchId,
        partition: PartitionId,
        consumed: i64,
        planned: i64,
    },

    #[error("Planner used before recovery completed")]
    NotRecovered,

    #[error("No starting offset for partition {0}")]
    MissingStartingOffset(PartitionId),

    #[error("Executor Error - {0}")]
    Executor(String),

    #[error("CancellationToken Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the caller may retry the operation that produced this error. Everything else must
    /// halt the cycle (or the process) and be surfaced to an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. }
                | Error::Store(_)
                | Error::CommitTimeout { .. }
                | Error::CommitInProgress(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serde(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Store(value.to_string())
    }
}
