use std::sync::Arc;

use parking_lot::RwLock;

use offsetgate_core::source::UpstreamSource;
use offsetgate_core::types::{PartitionId, PartitionOffset};

use super::error_injector::SourceErrorInjector;
use crate::error::SimulationError;

/// Byte size of every simulated record.
pub const RECORD_SIZE: i64 = 64;

/// Cloning shares the log, so a producer task can keep appending while the core reads.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    stream: String,
    /// Messages per partition.
    counts: Arc<RwLock<Vec<i64>>>,
    injector: Arc<SourceErrorInjector>,
}

impl SimulatedSource {
    pub fn new(stream: impl Into<String>, partitions: u32) -> Self {
        Self {
            stream: stream.into(),
            counts: Arc::new(RwLock::new(vec![0; partitions as usize])),
            injector: Arc::new(SourceErrorInjector::new()),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn error_injector(&self) -> &SourceErrorInjector {
        &self.injector
    }

    /// Appends `messages` to `partition`, ignoring unknown partitions.
    pub fn append(&self, partition: u32, messages: i64) {
        if let Some(count) = self.counts.write().get_mut(partition as usize) {
            *count += messages.max(0);
        }
    }

    /// Appends `messages` to every partition.
    pub fn append_all(&self, messages: i64) {
        for count in self.counts.write().iter_mut() {
            *count += messages.max(0);
        }
    }

    /// Adds an empty partition and returns it.
    pub fn add_partition(&self) -> PartitionId {
        let mut counts = self.counts.write();
        counts.push(0);
        PartitionId::new(self.stream.clone(), (counts.len() - 1) as u32)
    }

    /// Drops the newest partition, which no real log would ever do.
    pub fn remove_last_partition(&self) {
        self.counts.write().pop();
    }

    pub fn partitions(&self) -> u32 {
        self.counts.read().len() as u32
    }

    /// Position of the newest message of `partition`, the sentinel while it is empty.
    pub fn latest(&self, partition: &PartitionId) -> Option<PartitionOffset> {
        if partition.stream != self.stream {
            return None;
        }
        let count = *self.counts.read().get(partition.index as usize)?;
        Some(position_of(count - 1))
    }
}

/// Position of the message with sequence number `seq_no`.
pub fn position_of(seq_no: i64) -> PartitionOffset {
    if seq_no < 0 {
        return PartitionOffset::START_OF_STREAM;
    }
    PartitionOffset::new(seq_no * RECORD_SIZE, seq_no)
}

impl UpstreamSource for SimulatedSource {
    async fn partition_count(&self, stream: &str) -> offsetgate_core::Result<u32> {
        self.injector.apply_latency().await;
        if self.injector.should_fail_count() {
            return Err(SimulationError::Unreachable(format!("partition count of {stream}")).into());
        }
        if stream != self.stream {
            return Err(SimulationError::UnknownPartition(stream.to_string()).into());
        }
        Ok(self.partitions())
    }

    async fn latest_position(
        &self,
        partition: &PartitionId,
    ) -> offsetgate_core::Result<PartitionOffset> {
        self.injector.apply_latency().await;
        if self.injector.should_fail_fetch() {
            return Err(
                SimulationError::Unreachable(format!("latest position of {partition}")).into(),
            );
        }
        self.latest(partition)
            .ok_or_else(|| SimulationError::UnknownPartition(partition.to_string()).into())
    }
}
