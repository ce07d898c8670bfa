//! Upload Engine
//!
//! Drives one chunk submission through the pipeline:
//!
//! ```text
//! admit ──► ChunkStore::put ──► mark_received ──┬─► receipt (receiving)
//!                                               │
//!                                        [claim combine]
//!                                               │
//!                     combine ──► verify ──► settle ──► cleanup ──► purge
//! ```
//!
//! Only the claim is serialised. Combining and hashing run without any lock
//! held, on a spawned task so that a dropped request cannot abandon a claim
//! half way.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::buffer_pool::{BufferPool, BufferPoolStats};
use super::chunk_store::ChunkStore;
use super::combiner::Combiner;
use super::gc::GarbageCollector;
use super::tracker::{CombineClaim, UploadTracker};
use super::types::{
    ChunkMeta, ChunkReceipt, SessionSnapshot, SessionState, UploadError, VerifyOutcome,
    DEFAULT_BUFFER_POOL_SIZE, DEFAULT_COPY_BUFFER_SIZE, DEFAULT_MAX_TOTAL_CHUNKS,
    DEFAULT_SESSION_IDLE_SECS,
};
use super::verifier::IntegrityVerifier;

/// Storage roots and buffer sizing handed to the engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Root for `<upload_id>-chunk-<index>` artifacts
    pub chunk_dir: PathBuf,
    /// Root for verified `<upload_id>` files
    pub final_dir: PathBuf,
    /// Size of each pooled copy buffer
    pub copy_buffer_size: usize,
    /// Idle buffers kept by the pool
    pub buffer_pool_size: usize,
    /// Largest `total-chunk` a new upload may declare
    pub max_total_chunks: usize,
    /// Receiving sessions quiet for this long are dropped
    pub session_idle_timeout: Duration,
}

impl EngineOptions {
    pub fn new(chunk_dir: impl Into<PathBuf>, final_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunk_dir: chunk_dir.into(),
            final_dir: final_dir.into(),
            copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
            buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
            session_idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_SECS),
        }
    }
}

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub chunks_stored: u64,
    pub duplicate_chunks: u64,
    pub combines: u64,
    pub verifications: u64,
    pub uploads_verified: u64,
    pub uploads_failed: u64,
    pub sessions_expired: u64,
}

#[derive(Default)]
struct EngineCounters {
    chunks_stored: AtomicU64,
    duplicate_chunks: AtomicU64,
    combines: AtomicU64,
    verifications: AtomicU64,
    uploads_verified: AtomicU64,
    uploads_failed: AtomicU64,
    sessions_expired: AtomicU64,
}

impl EngineCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            combines: self.combines.load(Ordering::Relaxed),
            verifications: self.verifications.load(Ordering::Relaxed),
            uploads_verified: self.uploads_verified.load(Ordering::Relaxed),
            uploads_failed: self.uploads_failed.load(Ordering::Relaxed),
            sessions_expired: self.sessions_expired.load(Ordering::Relaxed),
        }
    }
}

/// Chunk reassembly engine
#[derive(Clone)]
pub struct UploadEngine {
    inner: Arc<UploadEngineInner>,
}

struct UploadEngineInner {
    chunk_store: ChunkStore,
    tracker: UploadTracker,
    combiner: Combiner,
    verifier: IntegrityVerifier,
    gc: GarbageCollector,
    buffers: Arc<BufferPool>,
    counters: EngineCounters,
    session_idle_timeout: Duration,
}

impl UploadEngine {
    /// Create an engine backed by the local filesystem
    pub fn new(options: EngineOptions) -> Self {
        let chunk_store = ChunkStore::with_local_storage(options.chunk_dir.clone());
        Self::with_chunk_store(options, chunk_store)
    }

    /// Create an engine with a specific chunk store backend
    pub fn with_chunk_store(options: EngineOptions, chunk_store: ChunkStore) -> Self {
        let buffers = Arc::new(BufferPool::new(
            options.copy_buffer_size,
            options.buffer_pool_size,
        ));

        Self {
            inner: Arc::new(UploadEngineInner {
                combiner: Combiner::new(
                    chunk_store.clone(),
                    options.final_dir.clone(),
                    buffers.clone(),
                ),
                verifier: IntegrityVerifier::new(buffers.clone()),
                gc: GarbageCollector::new(
                    chunk_store.clone(),
                    vec![options.chunk_dir, options.final_dir],
                ),
                tracker: UploadTracker::with_max_total_chunks(options.max_total_chunks),
                chunk_store,
                buffers,
                counters: EngineCounters::default(),
                session_idle_timeout: options.session_idle_timeout,
            }),
        }
    }

    // ========================================================================
    // Submission
    // ========================================================================

    /// Accept one chunk.
    ///
    /// Returns the session state after the chunk was registered. If this chunk
    /// completed the upload, the call also runs the combine and verification
    /// and reports `Verified`, or the error that failed the upload.
    pub async fn submit_chunk(
        &self,
        meta: ChunkMeta,
        data: &[u8],
    ) -> Result<ChunkReceipt, UploadError> {
        let inner = &self.inner;

        loop {
            let handle = inner.tracker.admit(&meta)?;

            let outcome = inner.chunk_store.put(&meta.upload_id, meta.index, data).await?;
            if outcome.is_duplicate() {
                EngineCounters::bump(&inner.counters.duplicate_chunks);
            } else {
                EngineCounters::bump(&inner.counters.chunks_stored);
            }

            // The session may have finished while the chunk was written;
            // start over against a fresh one.
            let Ok(arrival) = inner.tracker.mark_received(&handle, meta.index) else {
                tracing::debug!(
                    upload_id = %meta.upload_id,
                    chunk_index = meta.index,
                    "Session finished during write, resubmitting"
                );
                continue;
            };

            let mut receipt = ChunkReceipt {
                filename: meta.upload_id.clone(),
                chunk_index: meta.index,
                total_chunks: arrival.total_chunks,
                chunks_received: arrival.chunks_received,
                duplicate: outcome.is_duplicate() || arrival.duplicate,
                state: arrival.state,
            };

            if let Some(claim) = arrival.claim {
                receipt.state = self.run_finalize(claim).await?;
            }

            return Ok(receipt);
        }
    }

    async fn run_finalize(&self, claim: CombineClaim) -> Result<SessionState, UploadError> {
        let inner = self.inner.clone();
        let upload_id = claim.upload_id().to_string();

        match tokio::spawn(async move { inner.finalize(claim).await }).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(upload_id = %upload_id, error = %e, "Finalize task aborted");
                Err(UploadError::FinalizeFailed {
                    upload_id,
                    source: std::io::Error::other(e.to_string()),
                })
            }
        }
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Current view of an upload still in flight
    pub fn session(&self, upload_id: &str) -> Option<SessionSnapshot> {
        self.inner.tracker.snapshot(upload_id)
    }

    pub fn stats(&self) -> EngineStats {
        self.inner.counters.snapshot()
    }

    pub fn buffer_stats(&self) -> BufferPoolStats {
        self.inner.buffers.stats()
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    /// Path a verified upload is stored under
    pub fn final_path(&self, upload_id: &str) -> PathBuf {
        self.inner.combiner.final_path(upload_id)
    }

    /// Remove staging files from an earlier run; call before serving
    pub async fn sweep_staging(&self) -> Result<usize, UploadError> {
        self.inner.gc.sweep_staging().await
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Drop sessions idle past the configured timeout and delete their chunks.
    ///
    /// Returns the number of sessions expired.
    pub async fn expire_idle_sessions(&self) -> usize {
        self.expire_sessions_idle_for(self.inner.session_idle_timeout)
            .await
    }

    async fn expire_sessions_idle_for(&self, max_idle: Duration) -> usize {
        let inner = &self.inner;
        let expired = inner.tracker.expire_idle(max_idle);

        for session in &expired {
            EngineCounters::bump(&inner.counters.sessions_expired);
            // A retry may already have opened a fresh session under this ID
            if inner.tracker.snapshot(&session.upload_id).is_some() {
                continue;
            }
            inner
                .gc
                .cleanup_chunks(&session.upload_id, session.total_chunks)
                .await;
        }

        expired.len()
    }

    /// Start background expiry task
    pub fn start_expiry_task(self, period: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;
                self.expire_idle_sessions().await;
            }
        })
    }
}

/// Report I/O trouble during combine, verify or promote as a failed finalize
fn finalize_error(upload_id: &str, err: UploadError) -> UploadError {
    match err {
        UploadError::Io(source) => UploadError::FinalizeFailed {
            upload_id: upload_id.to_string(),
            source,
        },
        other => other,
    }
}

impl UploadEngineInner {
    /// Combine, verify, settle and clean up a claimed session
    async fn finalize(&self, claim: CombineClaim) -> Result<SessionState, UploadError> {
        let upload_id = claim.upload_id().to_string();
        let total_chunks = claim.total_chunks();

        EngineCounters::bump(&self.counters.combines);
        let staged = match self.combiner.combine(&upload_id, total_chunks).await {
            Ok(staged) => staged,
            Err(e) => {
                // Chunks stay on disk so the same data can be resubmitted
                EngineCounters::bump(&self.counters.uploads_failed);
                claim.finish(SessionState::Failed);
                return Err(finalize_error(&upload_id, e));
            }
        };

        claim.begin_verifying();
        EngineCounters::bump(&self.counters.verifications);

        let outcome = match self
            .verifier
            .verify_and_settle(staged, claim.expected_checksum())
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(upload_id = %upload_id, error = %e, "Verification failed");
                EngineCounters::bump(&self.counters.uploads_failed);
                claim.finish(SessionState::Failed);
                return Err(finalize_error(&upload_id, e));
            }
        };

        // Chunks go before the session is purged, so a fresh upload under the
        // same ID cannot have its chunks collected.
        self.gc.cleanup_chunks(&upload_id, total_chunks).await;

        match outcome {
            VerifyOutcome::Verified { .. } => {
                EngineCounters::bump(&self.counters.uploads_verified);
                claim.finish(SessionState::Verified);
                Ok(SessionState::Verified)
            }
            VerifyOutcome::ChecksumMismatch { expected, actual } => {
                EngineCounters::bump(&self.counters.uploads_failed);
                claim.finish(SessionState::Failed);
                Err(UploadError::ChecksumMismatch {
                    upload_id,
                    expected,
                    actual,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::compute_hash;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> UploadEngine {
        UploadEngine::new(EngineOptions::new(
            dir.path().join("chunks"),
            dir.path().join("final"),
        ))
    }

    #[tokio::test]
    async fn test_idle_session_expires_with_chunks() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let stale = compute_hash(b"abandoned");

        engine
            .submit_chunk(ChunkMeta::new("report.pdf", 0, 2, &stale), b"aband")
            .await
            .unwrap();

        // Default timeout is a day, nothing goes
        assert_eq!(engine.expire_idle_sessions().await, 0);
        assert!(engine.session("report.pdf").is_some());

        assert_eq!(engine.expire_sessions_idle_for(Duration::ZERO).await, 1);
        assert!(engine.session("report.pdf").is_none());
        assert_eq!(engine.chunk_store().count("report.pdf").await.unwrap(), 0);
        assert_eq!(engine.stats().sessions_expired, 1);

        // The name is free for a different file
        let fresh = compute_hash(b"replacement");
        let receipt = engine
            .submit_chunk(ChunkMeta::new("report.pdf", 0, 1, &fresh), b"replacement")
            .await
            .unwrap();
        assert_eq!(receipt.state, SessionState::Verified);
        assert_eq!(
            std::fs::read(engine.final_path("report.pdf")).unwrap(),
            b"replacement"
        );
    }

    #[tokio::test]
    async fn test_expiry_task_runs_periodically() {
        let dir = TempDir::new().unwrap();
        let mut options = EngineOptions::new(dir.path().join("chunks"), dir.path().join("final"));
        options.session_idle_timeout = Duration::ZERO;
        let engine = UploadEngine::new(options);

        engine
            .submit_chunk(ChunkMeta::new("t", 0, 2, compute_hash(b"tt")), b"t")
            .await
            .unwrap();

        let task = engine.clone().start_expiry_task(Duration::from_millis(10));
        for _ in 0..100 {
            if engine.session("t").is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.abort();

        assert!(engine.session("t").is_none());
        assert_eq!(engine.chunk_store().count("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_total_chunks_limit_from_options() {
        let dir = TempDir::new().unwrap();
        let mut options = EngineOptions::new(dir.path().join("chunks"), dir.path().join("final"));
        options.max_total_chunks = 4;
        let engine = UploadEngine::new(options);

        let err = engine
            .submit_chunk(ChunkMeta::new("big", 0, 5, compute_hash(b"x")), b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidHeader { header: "total-chunk", .. }));
        assert!(engine.session("big").is_none());
        assert_eq!(engine.chunk_store().count("big").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_longest_upload_id_round_trips() {
        use crate::upload::MAX_UPLOAD_ID_LEN;

        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let data = b"edge of the name limit";
        let checksum = compute_hash(data);

        let longest = "n".repeat(MAX_UPLOAD_ID_LEN);
        let receipt = engine
            .submit_chunk(ChunkMeta::new(longest.as_str(), 0, 1, &checksum), data)
            .await
            .unwrap();
        assert_eq!(receipt.state, SessionState::Verified);
        assert_eq!(std::fs::read(engine.final_path(&longest)).unwrap(), data);

        let too_long = "n".repeat(MAX_UPLOAD_ID_LEN + 1);
        let err = engine
            .submit_chunk(ChunkMeta::new(too_long.as_str(), 0, 1, &checksum), data)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidUploadId { .. }));
    }

    #[tokio::test]
    async fn test_hello_world_out_of_order() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let checksum = compute_hash(b"HELLOWORLD");

        let r1 = engine
            .submit_chunk(ChunkMeta::new("hello.txt", 1, 3, &checksum), b"OWOR")
            .await
            .unwrap();
        assert_eq!(r1.state, SessionState::Receiving);
        assert_eq!(r1.chunks_received, 1);

        let r0 = engine
            .submit_chunk(ChunkMeta::new("hello.txt", 0, 3, &checksum), b"HELL")
            .await
            .unwrap();
        assert_eq!(r0.state, SessionState::Receiving);

        let r2 = engine
            .submit_chunk(ChunkMeta::new("hello.txt", 2, 3, &checksum), b"LD")
            .await
            .unwrap();
        assert_eq!(r2.state, SessionState::Verified);
        assert_eq!(r2.chunks_received, 3);

        assert_eq!(std::fs::read(engine.final_path("hello.txt")).unwrap(), b"HELLOWORLD");
        assert_eq!(engine.chunk_store().count("hello.txt").await.unwrap(), 0);
        assert!(engine.session("hello.txt").is_none());

        let stats = engine.stats();
        assert_eq!(stats.combines, 1);
        assert_eq!(stats.verifications, 1);
        assert_eq!(stats.uploads_verified, 1);
    }

    #[tokio::test]
    async fn test_validation_error_touches_nothing() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let checksum = compute_hash(b"abc");

        engine
            .submit_chunk(ChunkMeta::new("v", 0, 2, &checksum), b"a")
            .await
            .unwrap();

        let err = engine
            .submit_chunk(ChunkMeta::new("v", 1, 3, &checksum), b"bc")
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let indices = engine.chunk_store().list_indices("v").await.unwrap();
        assert_eq!(indices.into_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test]
    async fn test_buffers_returned_after_finalize() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let checksum = compute_hash(b"xy");

        engine
            .submit_chunk(ChunkMeta::new("b", 0, 2, &checksum), b"x")
            .await
            .unwrap();
        engine
            .submit_chunk(ChunkMeta::new("b", 1, 2, &checksum), b"y")
            .await
            .unwrap();

        let stats = engine.buffer_stats();
        assert_eq!(stats.active, 0);
        assert!(stats.idle >= 1);
    }
}
