//! The upstream partitioned log as the core sees it: how many partitions a stream has and the
//! newest position of each. Reading records is the engine's business.

use crate::error::Result;
use crate::types::{PartitionId, PartitionOffset};

/// Failures should be reported as [Error::SourceUnavailable](crate::Error::SourceUnavailable)
/// when they are worth retrying.
#[trait_variant::make(Send)]
pub trait UpstreamSource: Sync {
    /// Number of partitions of `stream`.
    async fn partition_count(&self, stream: &str) -> Result<u32>;

    /// Position of the newest available message of one partition, or
    /// [PartitionOffset::START_OF_STREAM] while the partition is empty. Calls for different
    /// partitions are independent and may run concurrently.
    async fn latest_position(&self, partition: &PartitionId) -> Result<PartitionOffset>;
}
