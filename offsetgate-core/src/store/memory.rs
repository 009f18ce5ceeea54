use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::store::ProgressStore;
use crate::types::BatchId;

/// Process-local store. Each write replaces the value under one lock, which is all the
/// atomicity a single process needs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    streams: Arc<RwLock<HashMap<String, BTreeMap<BatchId, Bytes>>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for InMemoryStore {
    async fn read(&self, stream_uid: &str, batch_id: BatchId) -> Result<Option<Bytes>> {
        Ok(self
            .streams
            .read()
            .get(stream_uid)
            .and_then(|snapshots| snapshots.get(&batch_id))
            .cloned())
    }

    async fn atomic_write(&self, stream_uid: &str, batch_id: BatchId, value: Bytes) -> Result<()> {
        self.streams
            .write()
            .entry(stream_uid.to_string())
            .or_default()
            .insert(batch_id, value);
        Ok(())
    }

    async fn list(&self, stream_uid: &str) -> Result<Vec<BatchId>> {
        Ok(self
            .streams
            .read()
            .get(stream_uid)
            .map(|snapshots| snapshots.keys().copied().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, stream_uid: &str, batch_id: BatchId) -> Result<()> {
        if let Some(snapshots) = self.streams.write().get_mut(stream_uid) {
            snapshots.remove(&batch_id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = InMemoryStore::new();
        let other = store.clone();

        store
            .atomic_write("uid", 7, Bytes::from_static(b"seven"))
            .await
            .unwrap();
        assert_eq!(other.list("uid").await.unwrap(), vec![7]);

        other.delete("uid", 7).await.unwrap();
        assert!(store.read("uid", 7).await.unwrap().is_none());
    }
}
