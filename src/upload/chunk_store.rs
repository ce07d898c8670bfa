//! Chunk Store
//!
//! Durable storage for raw chunk bytes keyed by `(upload_id, index)`.
//!
//! Writes go to a dot-prefixed temporary file, are fsynced, and are then
//! linked into place under `<root>/<upload_id>-chunk-<index>`. Linking fails
//! if the target exists, so a repeated write for the same key is a no-op and
//! a reader never observes a half-written chunk.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use uuid::Uuid;

use super::types::{PutOutcome, UploadError};

/// Readable handle on one stored chunk
pub type ChunkReader = Box<dyn AsyncRead + Send + Unpin>;

// ============================================================================
// Chunk Storage Trait
// ============================================================================

/// Trait for chunk storage backends
#[async_trait::async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Store a chunk unless one already exists under the same key
    async fn put(
        &self,
        upload_id: &str,
        index: usize,
        data: &[u8],
    ) -> Result<PutOutcome, UploadError>;

    /// Open a chunk for streaming; `None` if it does not exist
    async fn open(&self, upload_id: &str, index: usize) -> Result<Option<ChunkReader>, UploadError>;

    /// Indices currently stored for an upload
    async fn list_indices(&self, upload_id: &str) -> Result<BTreeSet<usize>, UploadError>;

    /// Delete one chunk; returns whether anything was removed
    async fn delete(&self, upload_id: &str, index: usize) -> Result<bool, UploadError>;

    /// Number of chunks currently stored for an upload
    async fn count(&self, upload_id: &str) -> Result<usize, UploadError> {
        Ok(self.list_indices(upload_id).await?.len())
    }
}

// ============================================================================
// Chunk Store (Main Implementation)
// ============================================================================

/// Chunk store with a pluggable backend
#[derive(Clone)]
pub struct ChunkStore {
    backend: Arc<dyn ChunkStorage>,
}

impl ChunkStore {
    /// Create with local filesystem storage rooted at `chunk_dir`
    pub fn with_local_storage(chunk_dir: PathBuf) -> Self {
        Self::with_backend(Arc::new(LocalChunkStorage::new(chunk_dir)))
    }

    /// Create with any storage backend
    pub fn with_backend(backend: Arc<dyn ChunkStorage>) -> Self {
        Self { backend }
    }

    /// Store a chunk; an existing chunk under the same key is left untouched
    pub async fn put(
        &self,
        upload_id: &str,
        index: usize,
        data: &[u8],
    ) -> Result<PutOutcome, UploadError> {
        let outcome = self.backend.put(upload_id, index, data).await?;

        match outcome {
            PutOutcome::Stored => tracing::debug!(
                upload_id = %upload_id,
                chunk_index = index,
                size = data.len(),
                "Stored chunk"
            ),
            PutOutcome::AlreadyPresent => tracing::info!(
                upload_id = %upload_id,
                chunk_index = index,
                "Chunk already exists, skipping write"
            ),
        }

        Ok(outcome)
    }

    /// Open a chunk for streaming
    pub async fn get(&self, upload_id: &str, index: usize) -> Result<Option<ChunkReader>, UploadError> {
        self.backend.open(upload_id, index).await
    }

    /// Indices currently stored for an upload
    pub async fn list_indices(&self, upload_id: &str) -> Result<BTreeSet<usize>, UploadError> {
        self.backend.list_indices(upload_id).await
    }

    /// Number of chunks currently stored for an upload
    pub async fn count(&self, upload_id: &str) -> Result<usize, UploadError> {
        self.backend.count(upload_id).await
    }

    /// Delete one chunk
    pub async fn delete(&self, upload_id: &str, index: usize) -> Result<bool, UploadError> {
        self.backend.delete(upload_id, index).await
    }
}

// ============================================================================
// Local Filesystem Storage
// ============================================================================

/// Local filesystem chunk storage
pub struct LocalChunkStorage {
    root: PathBuf,
}

impl LocalChunkStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn chunk_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.root.join(chunk_file_name(upload_id, index))
    }

    fn temp_path(&self, upload_id: &str, index: usize) -> PathBuf {
        self.root.join(format!(
            ".{}.tmp.{}",
            chunk_file_name(upload_id, index),
            Uuid::new_v4()
        ))
    }

    async fn write_temp(&self, temp_path: &Path, data: &[u8]) -> std::io::Result<()> {
        let mut file = fs::File::create(temp_path).await?;
        file.write_all(data).await?;
        // Ensure data is on disk before the chunk becomes visible
        file.sync_all().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ChunkStorage for LocalChunkStorage {
    async fn put(
        &self,
        upload_id: &str,
        index: usize,
        data: &[u8],
    ) -> Result<PutOutcome, UploadError> {
        let path = self.chunk_path(upload_id, index);

        if fs::try_exists(&path).await? {
            return Ok(PutOutcome::AlreadyPresent);
        }

        fs::create_dir_all(&self.root).await?;

        let temp_path = self.temp_path(upload_id, index);
        if let Err(e) = self.write_temp(&temp_path, data).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        // hard_link refuses to replace an existing target, unlike rename
        let linked = fs::hard_link(&temp_path, &path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => {
                // Persist the new directory entry, not just the data
                sync_dir(&self.root).await?;
                Ok(PutOutcome::Stored)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyPresent),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, upload_id: &str, index: usize) -> Result<Option<ChunkReader>, UploadError> {
        match fs::File::open(self.chunk_path(upload_id, index)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_indices(&self, upload_id: &str) -> Result<BTreeSet<usize>, UploadError> {
        let mut indices = BTreeSet::new();

        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{upload_id}-chunk-");
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.parse::<usize>().ok())
            {
                indices.insert(index);
            }
        }

        Ok(indices)
    }

    async fn delete(&self, upload_id: &str, index: usize) -> Result<bool, UploadError> {
        match fs::remove_file(self.chunk_path(upload_id, index)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// File name of a chunk artifact: `<upload_id>-chunk-<index>`
pub fn chunk_file_name(upload_id: &str, index: usize) -> String {
    format!("{upload_id}-chunk-{index}")
}

/// Flush directory metadata so a link or rename inside `dir` survives a crash
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let dir = fs::File::open(dir).await?;
    dir.sync_all().await
}

#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
