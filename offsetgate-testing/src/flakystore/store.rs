use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use offsetgate_core::store::ProgressStore;
use offsetgate_core::store::memory::InMemoryStore;
use offsetgate_core::types::BatchId;

use super::error_injector::StoreErrorInjector;
use crate::error::SimulationError;

/// Wraps an [InMemoryStore]. Clones share both the data and the injector, so a test can keep a
/// handle while the tracker owns another.
#[derive(Debug, Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    injector: Arc<StoreErrorInjector>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_injector(&self) -> &StoreErrorInjector {
        &self.injector
    }
}

fn injected(op: &str, stream_uid: &str) -> offsetgate_core::Error {
    SimulationError::Store(format!("{op} for {stream_uid}")).into()
}

#[async_trait]
impl ProgressStore for FlakyStore {
    async fn read(
        &self,
        stream_uid: &str,
        batch_id: BatchId,
    ) -> offsetgate_core::Result<Option<Bytes>> {
        if self.injector.should_fail_read() {
            return Err(injected("read", stream_uid));
        }
        self.inner.read(stream_uid, batch_id).await
    }

    async fn atomic_write(
        &self,
        stream_uid: &str,
        batch_id: BatchId,
        value: Bytes,
    ) -> offsetgate_core::Result<()> {
        self.injector.apply_write_latency().await;
        if self.injector.should_fail_write() {
            return Err(injected("write", stream_uid));
        }
        self.inner.atomic_write(stream_uid, batch_id, value).await?;
        self.injector.record_write();
        Ok(())
    }

    async fn list(&self, stream_uid: &str) -> offsetgate_core::Result<Vec<BatchId>> {
        if self.injector.should_fail_list() {
            return Err(injected("list", stream_uid));
        }
        self.inner.list(stream_uid).await
    }

    async fn delete(&self, stream_uid: &str, batch_id: BatchId) -> offsetgate_core::Result<()> {
        if self.injector.should_fail_delete() {
            return Err(injected("delete", stream_uid));
        }
        self.inner.delete(stream_uid, batch_id).await
    }

    fn name(&self) -> &str {
        "flaky-memory"
    }
}
