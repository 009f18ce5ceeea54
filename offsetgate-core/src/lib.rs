//! Offset tracking and batch boundary planning for consuming a partitioned log in discrete,
//! exactly-once batches.
//!
//! A [tracker::ProgressTracker] owns what was durably processed, a [planner::BatchPlanner] decides
//! how far the next batch may read, and a [recovery::RecoveryCoordinator] reconciles both with
//! the engine's own checkpoint on startup. [runner::Runner] ties them to a trigger stream.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
pub mod engine;
pub mod error;
pub mod planner;
pub mod rate_limit;
pub mod recovery;
pub mod retry;
pub mod runner;
pub mod source;
pub mod store;
pub mod tracker;
pub mod types;

pub use error::{Error, Result};

use crate::config::{Settings, StreamIdGenerator};
use crate::engine::{BatchExecutor, EngineCheckpoint};
use crate::planner::BatchPlanner;
use crate::rate_limit::{RateLimiter, RateSignal};
use crate::runner::Runner;
use crate::source::UpstreamSource;
use crate::tracker::ProgressTracker;
use crate::types::PartitionId;

/// Wires a [Runner] for `settings.stream_name`: builds the store, allocates the stream uid,
/// discovers the partitions and opens the tracker. Recovery runs on the first
/// [Runner::run]/[Runner::recover].
pub async fn build_runner<S, E>(
    settings: &Settings,
    ids: &StreamIdGenerator,
    source: S,
    engine: E,
    signal: RateSignal,
    cancel: CancellationToken,
) -> Result<Runner<S, E>>
where
    S: UpstreamSource,
    E: EngineCheckpoint + BatchExecutor,
{
    let limiter = RateLimiter::new(settings.max_rate_per_partition)?;
    let store = settings.store_backend().build().await?;
    let stream_uid = ids.next_uid(&settings.consumer_group, &settings.stream_name);

    let partition_count = match settings.partition_count {
        Some(count) => count,
        None => tokio::time::timeout(
            settings.fetch_timeout,
            source.partition_count(&settings.stream_name),
        )
        .await
        .map_err(|_| Error::SourceUnavailable {
            reason: format!(
                "partition discovery for {} timed out after {:?}",
                settings.stream_name, settings.fetch_timeout
            ),
        })??,
    };
    let partitions = PartitionId::all(&settings.stream_name, partition_count);

    info!(
        stream = %settings.stream_name,
        %stream_uid,
        partition_count,
        store = store.name(),
        max_rate_per_partition = settings.max_rate_per_partition,
        "Starting progress tracking"
    );

    let tracker =
        ProgressTracker::open(stream_uid, store, &partitions, settings.tracker_options()).await?;
    let planner = BatchPlanner::new(
        settings.stream_name.clone(),
        source,
        Arc::new(tracker),
        limiter,
        signal,
        settings.planner_options(),
        cancel.clone(),
    );
    Ok(Runner::new(planner, engine, cancel))
}
