use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::ProgressStore;
use crate::types::BatchId;

const TMP_PREFIX: &str = ".tmp_";

/// Stores every snapshot as `<root>/<stream uid>/<batch id>`.
///
/// A snapshot is written to a temp file in the same directory, synced, and then renamed over
/// its final name, so a reader never observes a half written file. Leftover temp files from a
/// crash are ignored by [ProgressStore::list] and removed on [FileStore::open].
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|e| {
            Error::Store(format!(
                "Failed to create progress directory {}: {e}",
                root.display()
            ))
        })?;

        let store = Self { root };
        store.remove_stale_temp_files().await;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn stream_dir(&self, stream_uid: &str) -> PathBuf {
        self.root.join(stream_uid)
    }

    fn snapshot_path(&self, stream_uid: &str, batch_id: BatchId) -> PathBuf {
        self.stream_dir(stream_uid).join(batch_id.to_string())
    }

    /// Temp files belong to writes that never got published; they carry no committed state.
    async fn remove_stale_temp_files(&self) {
        let Ok(mut streams) = fs::read_dir(&self.root).await else {
            return;
        };
        while let Ok(Some(stream)) = streams.next_entry().await {
            let Ok(mut entries) = fs::read_dir(stream.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.file_name().to_string_lossy().starts_with(TMP_PREFIX)
                    && let Err(e) = fs::remove_file(entry.path()).await
                {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "Failed to remove stale temp file"
                    );
                }
            }
        }
    }
}

#[async_trait]
impl ProgressStore for FileStore {
    async fn read(&self, stream_uid: &str, batch_id: BatchId) -> Result<Option<Bytes>> {
        let path = self.snapshot_path(stream_uid, batch_id);
        match fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Store(format!(
                "Failed to read snapshot {}: {e}",
                path.display()
            ))),
        }
    }

    async fn atomic_write(&self, stream_uid: &str, batch_id: BatchId, value: Bytes) -> Result<()> {
        let dir = self.stream_dir(stream_uid);
        fs::create_dir_all(&dir).await?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Store(format!("Failed to get timestamp: {e}")))?
            .as_nanos();
        let tmp_path = dir.join(format!("{TMP_PREFIX}{batch_id}_{nanos}"));
        let final_path = self.snapshot_path(stream_uid, batch_id);

        let written = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&value).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &final_path).await
        }
        .await;

        if let Err(e) = written {
            // best effort, a leftover is cleaned up on the next open
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Store(format!(
                "Failed to publish snapshot {}: {e}",
                final_path.display()
            )));
        }

        // make the rename itself durable
        if let Ok(dir_handle) = fs::File::open(&dir).await
            && let Err(e) = dir_handle.sync_all().await
        {
            warn!(dir = %dir.display(), error = %e, "Failed to sync progress directory");
        }

        debug!(path = %final_path.display(), bytes = value.len(), "Published snapshot");
        Ok(())
    }

    async fn list(&self, stream_uid: &str) -> Result<Vec<BatchId>> {
        let dir = self.stream_dir(stream_uid);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(Error::Store(format!(
                    "Failed to list {}: {e}",
                    dir.display()
                )));
            }
        };

        let mut ids = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match name.parse::<BatchId>() {
                Ok(id) => ids.push(id),
                Err(_) if name.starts_with(TMP_PREFIX) => {}
                Err(_) => warn!(file = %name, "Ignoring unexpected file in progress directory"),
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    async fn delete(&self, stream_uid: &str, batch_id: BatchId) -> Result<()> {
        match fs::remove_file(self.snapshot_path(stream_uid, batch_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Store(format!(
                "Failed to delete snapshot {batch_id} of {stream_uid}: {e}"
            ))),
        }
    }

    fn name(&self) -> &str {
        "fs"
    }
}
