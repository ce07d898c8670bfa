//! Garbage Collector
//!
//! Removes chunk artifacts once an upload reaches a terminal state, and
//! clears staging files left behind by a crash.

use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::PathBuf;

use tokio::fs;

use super::chunk_store::ChunkStore;
use super::types::UploadError;

/// Result of a chunk cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Chunks deleted
    pub removed: usize,
    /// Indices whose deletion failed
    pub failed: Vec<usize>,
}

/// Deletes artifacts that no longer belong to a live upload
pub struct GarbageCollector {
    chunk_store: ChunkStore,
    staging_dirs: Vec<PathBuf>,
}

impl GarbageCollector {
    pub fn new(chunk_store: ChunkStore, staging_dirs: Vec<PathBuf>) -> Self {
        Self {
            chunk_store,
            staging_dirs,
        }
    }

    /// Delete every chunk artifact of `upload_id`.
    ///
    /// Covers `0..total_chunks` plus anything else listed for the upload.
    /// Failures are logged and reported, never raised.
    pub async fn cleanup_chunks(&self, upload_id: &str, total_chunks: usize) -> CleanupReport {
        let mut indices: BTreeSet<usize> = (0..total_chunks).collect();
        match self.chunk_store.list_indices(upload_id).await {
            Ok(listed) => indices.extend(listed),
            Err(e) => tracing::warn!(
                upload_id = %upload_id,
                error = %e,
                "Failed to list chunks, deleting expected indices only"
            ),
        }

        let mut report = CleanupReport::default();
        for index in indices {
            match self.chunk_store.delete(upload_id, index).await {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        upload_id = %upload_id,
                        chunk_index = index,
                        error = %e,
                        "Failed to delete chunk"
                    );
                    report.failed.push(index);
                }
            }
        }

        tracing::info!(
            upload_id = %upload_id,
            removed = report.removed,
            failed = report.failed.len(),
            "Cleaned up chunks"
        );

        report
    }

    /// Remove dot-prefixed staging files (`*.tmp.*`, `*.partial.*`).
    ///
    /// Only safe before any upload is in flight.
    pub async fn sweep_staging(&self) -> Result<usize, UploadError> {
        let mut removed = 0;

        for dir in &self.staging_dirs {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if is_staging_name(name) && entry.file_type().await?.is_file() {
                    fs::remove_file(entry.path()).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(count = removed, "Removed leftover staging files");
        }

        Ok(removed)
    }
}

fn is_staging_name(name: &str) -> bool {
    name.starts_with('.') && (name.contains(".tmp.") || name.contains(".partial."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_cleanup_removes_expected_and_extra_chunks() {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::with_local_storage(dir.path().to_path_buf());
        store.put("f", 0, b"a").await.unwrap();
        store.put("f", 1, b"b").await.unwrap();
        store.put("f", 9, b"stale").await.unwrap();
        store.put("other", 0, b"keep").await.unwrap();

        let gc = GarbageCollector::new(store.clone(), vec![]);
        let report = gc.cleanup_chunks("f", 3).await;

        assert_eq!(report.removed, 3);
        assert!(report.failed.is_empty());
        assert_eq!(store.count("f").await.unwrap(), 0);
        assert_eq!(store.count("other").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_staging_files() {
        let dir = TempDir::new().unwrap();
        let chunks = dir.path().join("chunks");
        let finals = dir.path().join("final");
        std::fs::create_dir_all(&chunks).unwrap();
        std::fs::create_dir_all(&finals).unwrap();

        std::fs::write(chunks.join(".a-chunk-0.tmp.1234"), b"x").unwrap();
        std::fs::write(chunks.join("a-chunk-1"), b"x").unwrap();
        std::fs::write(finals.join(".a.partial.5678"), b"x").unwrap();
        std::fs::write(finals.join("a"), b"x").unwrap();

        let store = ChunkStore::with_local_storage(chunks.clone());
        let gc = GarbageCollector::new(store, vec![chunks.clone(), finals.clone(), dir.path().join("missing")]);

        assert_eq!(gc.sweep_staging().await.unwrap(), 2);
        assert!(chunks.join("a-chunk-1").exists());
        assert!(finals.join("a").exists());
    }

    #[test]
    fn test_staging_names() {
        assert!(is_staging_name(".movie.mp4-chunk-3.tmp.0f0f"));
        assert!(is_staging_name(".movie.mp4.partial.0f0f"));
        assert!(!is_staging_name("movie.mp4"));
        assert!(!is_staging_name("movie.mp4-chunk-3"));
    }
}
