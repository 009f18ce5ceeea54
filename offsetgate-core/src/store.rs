//! Durable storage behind the [ProgressTracker](crate::tracker::ProgressTracker).
//!
//! Any backend offering `{read, atomic_write, list, delete}` over `(stream uid, batch id)` keys
//! can hold committed snapshots. The trait is object safe so the tracker holds an
//! `Arc<dyn ProgressStore>` and the backend is picked from configuration.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::types::BatchId;

pub mod fs;
pub mod memory;

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Serialized snapshot stored for `batch_id`, `None` if there is none.
    async fn read(&self, stream_uid: &str, batch_id: BatchId) -> Result<Option<Bytes>>;

    /// Publishes `value` for `batch_id`. Readers either see the complete value or nothing.
    async fn atomic_write(&self, stream_uid: &str, batch_id: BatchId, value: Bytes) -> Result<()>;

    /// All batch ids with a published snapshot, ascending.
    async fn list(&self, stream_uid: &str) -> Result<Vec<BatchId>>;

    async fn delete(&self, stream_uid: &str, batch_id: BatchId) -> Result<()>;

    /// Backend name, for logs.
    fn name(&self) -> &str;
}

/// Which [ProgressStore] backend to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Snapshot files under a progress tracking directory.
    Fs(PathBuf),
    /// Process-local, nothing survives a restart.
    Memory,
}

impl StoreBackend {
    pub async fn build(&self) -> Result<Arc<dyn ProgressStore>> {
        Ok(match self {
            StoreBackend::Fs(dir) => Arc::new(fs::FileStore::open(dir.clone()).await?),
            StoreBackend::Memory => Arc::new(memory::InMemoryStore::new()),
        })
    }
}
