//! Combiner
//!
//! Streams chunks `0..total_chunks` in index order into a staging file in the
//! final directory. The staging file is dot-prefixed and only reaches its
//! final name through [`StagedArtifact::promote`], after verification.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use super::buffer_pool::BufferPool;
use super::chunk_store::{sync_dir, ChunkStore};
use super::types::UploadError;

/// Reassembled file waiting for verification
#[derive(Debug)]
pub struct StagedArtifact {
    upload_id: String,
    staging_path: PathBuf,
    final_path: PathBuf,
    bytes: u64,
}

impl StagedArtifact {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Bytes written
    pub fn size(&self) -> u64 {
        self.bytes
    }

    /// Rename into place under the final name
    pub async fn promote(self) -> Result<PathBuf, UploadError> {
        if let Err(e) = fs::rename(&self.staging_path, &self.final_path).await {
            let _ = fs::remove_file(&self.staging_path).await;
            return Err(e.into());
        }
        if let Some(dir) = self.final_path.parent() {
            sync_dir(dir).await?;
        }
        Ok(self.final_path)
    }

    /// Delete the staging file
    pub async fn discard(self) {
        if let Err(e) = fs::remove_file(&self.staging_path).await {
            tracing::warn!(
                upload_id = %self.upload_id,
                path = %self.staging_path.display(),
                error = %e,
                "Failed to remove staging file"
            );
        }
    }
}

/// Reassembles stored chunks into one file
pub struct Combiner {
    chunk_store: ChunkStore,
    final_dir: PathBuf,
    buffers: Arc<BufferPool>,
}

impl Combiner {
    pub fn new(chunk_store: ChunkStore, final_dir: PathBuf, buffers: Arc<BufferPool>) -> Self {
        Self {
            chunk_store,
            final_dir,
            buffers,
        }
    }

    /// Where a verified upload ends up
    pub fn final_path(&self, upload_id: &str) -> PathBuf {
        self.final_dir.join(upload_id)
    }

    /// Concatenate every chunk of `upload_id` in index order.
    ///
    /// A missing chunk aborts with `InconsistentState`. On any error the
    /// staging file is removed and chunk artifacts are left as they were.
    pub async fn combine(
        &self,
        upload_id: &str,
        total_chunks: usize,
    ) -> Result<StagedArtifact, UploadError> {
        fs::create_dir_all(&self.final_dir).await?;

        let staging_path = self
            .final_dir
            .join(format!(".{}.partial.{}", upload_id, Uuid::new_v4()));

        tracing::info!(
            upload_id = %upload_id,
            chunks = total_chunks,
            "Combining chunks"
        );

        match self.write_chunks(upload_id, total_chunks, &staging_path).await {
            Ok(bytes) => {
                tracing::info!(upload_id = %upload_id, size = bytes, "Combined chunks");
                Ok(StagedArtifact {
                    upload_id: upload_id.to_string(),
                    staging_path,
                    final_path: self.final_path(upload_id),
                    bytes,
                })
            }
            Err(e) => {
                let _ = fs::remove_file(&staging_path).await;
                tracing::error!(upload_id = %upload_id, error = %e, "Combine failed");
                Err(e)
            }
        }
    }

    async fn write_chunks(
        &self,
        upload_id: &str,
        total_chunks: usize,
        staging_path: &Path,
    ) -> Result<u64, UploadError> {
        let mut output = fs::File::create(staging_path).await?;
        let mut buf = self.buffers.acquire();
        let mut written = 0u64;

        for index in 0..total_chunks {
            let Some(mut reader) = self.chunk_store.get(upload_id, index).await? else {
                return Err(UploadError::InconsistentState {
                    upload_id: upload_id.to_string(),
                    index,
                });
            };

            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n]).await?;
                written += n as u64;
            }

            tracing::debug!(upload_id = %upload_id, chunk_index = index, "Appended chunk");
        }

        output.flush().await?;
        output.sync_all().await?;

        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn combiner(dir: &TempDir) -> (ChunkStore, Combiner) {
        let store = ChunkStore::with_local_storage(dir.path().join("chunks"));
        let combiner = Combiner::new(
            store.clone(),
            dir.path().join("final"),
            Arc::new(BufferPool::new(3, 2)),
        );
        (store, combiner)
    }

    #[tokio::test]
    async fn test_chunks_concatenated_in_index_order() {
        let dir = TempDir::new().unwrap();
        let (store, combiner) = combiner(&dir);

        store.put("hello.txt", 2, b"LD").await.unwrap();
        store.put("hello.txt", 0, b"HELL").await.unwrap();
        store.put("hello.txt", 1, b"OWOR").await.unwrap();

        let staged = combiner.combine("hello.txt", 3).await.unwrap();
        assert_eq!(staged.size(), 10);
        assert_eq!(std::fs::read(staged.staging_path()).unwrap(), b"HELLOWORLD");
        assert!(!staged.final_path().exists());

        let final_path = staged.promote().await.unwrap();
        assert_eq!(std::fs::read(final_path).unwrap(), b"HELLOWORLD");
    }

    #[tokio::test]
    async fn test_missing_chunk_is_inconsistent_state() {
        let dir = TempDir::new().unwrap();
        let (store, combiner) = combiner(&dir);

        store.put("gap", 0, b"aa").await.unwrap();
        store.put("gap", 2, b"cc").await.unwrap();

        let err = combiner.combine("gap", 3).await.unwrap_err();
        assert!(matches!(err, UploadError::InconsistentState { index: 1, .. }));

        // Staging file removed, chunks untouched
        let leftovers = std::fs::read_dir(dir.path().join("final")).unwrap().count();
        assert_eq!(leftovers, 0);
        assert_eq!(store.count("gap").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_discard_removes_staging_file() {
        let dir = TempDir::new().unwrap();
        let (store, combiner) = combiner(&dir);

        store.put("tmp", 0, b"x").await.unwrap();
        let staged = combiner.combine("tmp", 1).await.unwrap();
        let path = staged.staging_path().to_path_buf();

        staged.discard().await;
        assert!(!path.exists());
    }
}
