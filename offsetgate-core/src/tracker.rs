//! The Progress Tracker is the single authority on what has been durably processed. It owns the
//! current [CommittedState] and its persistence through a [ProgressStore].
//!
//! The current state is published copy-on-write: readers clone an `Arc` to a complete snapshot
//! and a commit swaps the `Arc` only after the store accepted the new snapshot, so nobody ever
//! observes a half applied commit. Commits are serialized; a second commit while one is running
//! is rejected rather than queued.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::ProgressStore;
use crate::types::{BatchId, CommittedState, PartitionId, PartitionOffset};

const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RETENTION: usize = 100;

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// Upper bound for one durable write; exceeding it fails the commit.
    pub commit_timeout: Duration,
    /// Number of newest snapshots kept after each commit.
    pub retention: usize,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// On-disk form of a snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSnapshot {
    batch_id: BatchId,
    committed_at: DateTime<Utc>,
    offsets: BTreeMap<PartitionId, PartitionOffset>,
}

pub struct ProgressTracker {
    stream_uid: String,
    store: Arc<dyn ProgressStore>,
    current: RwLock<Arc<CommittedState>>,
    commit_lock: tokio::sync::Mutex<()>,
    options: TrackerOptions,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("stream_uid", &self.stream_uid)
            .field("store", &self.store.name())
            .field("batch_id", &self.current.read().batch_id)
            .finish()
    }
}

impl ProgressTracker {
    /// Loads the newest persisted snapshot of `stream_uid`, or starts from the all-sentinel
    /// initial state over `partitions` if the stream was never committed.
    pub async fn open(
        stream_uid: impl Into<String>,
        store: Arc<dyn ProgressStore>,
        partitions: &[PartitionId],
        options: TrackerOptions,
    ) -> Result<Self> {
        let stream_uid = stream_uid.into();
        let newest = store.list(&stream_uid).await?.last().copied();

        let current = match newest {
            Some(batch_id) => {
                let state = Self::load(store.as_ref(), &stream_uid, batch_id)
                    .await?
                    .ok_or(Error::NotFound(batch_id))?;
                info!(%stream_uid, batch_id, store = store.name(), "Loaded committed progress");
                state
            }
            None => {
                info!(%stream_uid, store = store.name(), "No committed progress, starting fresh");
                CommittedState::initial(partitions)
            }
        };

        Ok(Self {
            stream_uid,
            store,
            current: RwLock::new(Arc::new(current)),
            commit_lock: tokio::sync::Mutex::new(()),
            options,
        })
    }

    pub fn stream_uid(&self) -> &str {
        &self.stream_uid
    }

    /// The current truth. Always a complete snapshot.
    pub fn current(&self) -> Arc<CommittedState> {
        Arc::clone(&self.current.read())
    }

    /// Batch ids with a durable snapshot, ascending.
    pub async fn persisted_batch_ids(&self) -> Result<Vec<BatchId>> {
        self.store.list(&self.stream_uid).await
    }

    /// Snapshot committed for `batch_id`.
    ///
    /// With `best_effort`, a missing id falls back to the newest snapshot before it, or to the
    /// oldest known snapshot when every snapshot is newer. Without it, a missing id is
    /// [Error::NotFound].
    pub async fn read(&self, batch_id: BatchId, best_effort: bool) -> Result<CommittedState> {
        if let Some(state) = Self::load(self.store.as_ref(), &self.stream_uid, batch_id).await? {
            return Ok(state);
        }
        if !best_effort {
            return Err(Error::NotFound(batch_id));
        }

        let ids = self.persisted_batch_ids().await?;
        let fallback = ids
            .iter()
            .rev()
            .find(|id| **id < batch_id)
            .or_else(|| ids.first())
            .copied()
            .ok_or(Error::NotFound(batch_id))?;

        debug!(requested = batch_id, fallback, "Falling back to nearest snapshot");
        Self::load(self.store.as_ref(), &self.stream_uid, fallback)
            .await?
            .ok_or(Error::NotFound(fallback))
    }

    /// Persists `offsets` as the state of `batch_id` and makes it current.
    ///
    /// `batch_id` must directly follow the current batch, every current partition must be
    /// present and no sequence number may go backwards; violations are fatal. Store failures and
    /// timeouts leave the current state untouched and may be retried.
    pub async fn commit(
        &self,
        batch_id: BatchId,
        offsets: BTreeMap<PartitionId, PartitionOffset>,
    ) -> Result<Arc<CommittedState>> {
        let _guard = self
            .commit_lock
            .try_lock()
            .map_err(|_| Error::CommitInProgress(batch_id))?;

        let previous = self.current();
        if batch_id == previous.batch_id && offsets == previous.offsets {
            debug!(batch_id, "Batch already committed with identical offsets");
            return Ok(previous);
        }
        if batch_id != previous.next_batch_id() {
            return Err(Error::Invariant {
                batch_id,
                detail: format!(
                    "commit must follow batch {}, previous state {:?}",
                    previous.batch_id, previous.offsets
                ),
            });
        }
        validate_transition(&previous, batch_id, &offsets)?;

        let snapshot = StoredSnapshot {
            batch_id,
            committed_at: Utc::now(),
            offsets,
        };
        let encoded = Bytes::from(serde_json::to_vec(&snapshot)?);

        tokio::time::timeout(
            self.options.commit_timeout,
            self.store.atomic_write(&self.stream_uid, batch_id, encoded),
        )
        .await
        .map_err(|_| Error::CommitTimeout {
            batch_id,
            timeout: self.options.commit_timeout,
        })??;

        let next = Arc::new(CommittedState {
            batch_id,
            offsets: snapshot.offsets,
        });
        *self.current.write() = Arc::clone(&next);
        info!(stream_uid = %self.stream_uid, batch_id, "Committed progress");

        self.prune().await;
        Ok(next)
    }

    /// Drops snapshots beyond the retention window. Failures only cost disk space.
    async fn prune(&self) {
        let ids = match self.persisted_batch_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "Failed to list snapshots for pruning");
                return;
            }
        };
        let excess = ids.len().saturating_sub(self.options.retention.max(1));
        for batch_id in ids.into_iter().take(excess) {
            if let Err(e) = self.store.delete(&self.stream_uid, batch_id).await {
                warn!(batch_id, error = %e, "Failed to prune snapshot");
            }
        }
    }

    async fn load(
        store: &dyn ProgressStore,
        stream_uid: &str,
        batch_id: BatchId,
    ) -> Result<Option<CommittedState>> {
        let Some(raw) = store.read(stream_uid, batch_id).await? else {
            return Ok(None);
        };

        let snapshot: StoredSnapshot =
            serde_json::from_slice(&raw).map_err(|e| Error::Invariant {
                batch_id,
                detail: format!(
                    "malformed snapshot ({e}): {}",
                    String::from_utf8_lossy(&raw)
                ),
            })?;
        if snapshot.batch_id != batch_id {
            return Err(Error::Invariant {
                batch_id,
                detail: format!(
                    "snapshot stored under {batch_id} claims batch {}",
                    snapshot.batch_id
                ),
            });
        }

        Ok(Some(CommittedState {
            batch_id: snapshot.batch_id,
            offsets: snapshot.offsets,
        }))
    }
}

/// No partition may disappear and no sequence number may go backwards between two consecutive
/// committed states.
pub(crate) fn validate_transition(
    previous: &CommittedState,
    batch_id: BatchId,
    next: &BTreeMap<PartitionId, PartitionOffset>,
) -> Result<()> {
    let dropped: Vec<_> = previous
        .offsets
        .keys()
        .filter(|p| !next.contains_key(*p))
        .cloned()
        .collect();
    if !dropped.is_empty() {
        return Err(Error::Invariant {
            batch_id,
            detail: format!(
                "partitions {dropped:?} dropped, previous {:?}, next {next:?}",
                previous.offsets
            ),
        });
    }

    for (partition, offset) in next {
        if let Some(prev) = previous.offsets.get(partition)
            && offset.seq_no < prev.seq_no
        {
            return Err(Error::Invariant {
                batch_id,
                detail: format!(
                    "sequence number of {partition} went backwards from {} to {}",
                    prev.seq_no, offset.seq_no
                ),
            });
        }
    }
    Ok(())
}
