//! Chunked Upload Module
//!
//! Turns independently delivered chunks into one verified file:
//! - Durable, idempotent chunk storage
//! - Per-upload tracking of received indices
//! - Single ordered reassembly per completed upload
//! - SHA-256 verification of the reassembled file
//! - Cleanup of chunk artifacts after success or failure
//!
//! Flow:
//! 1. Chunk arrives with upload ID, index, total count and whole-file digest
//! 2. Tracker validates it against the session, chunk is written to disk
//! 3. The arrival that completes the index set claims the combine step
//! 4. Chunks are concatenated in order, hashed, and promoted or rejected
//! 5. Chunk artifacts are deleted and the session is released

pub mod buffer_pool;
pub mod chunk_store;
pub mod combiner;
pub mod engine;
pub mod gc;
pub mod tracker;
pub mod types;
pub mod verifier;

pub use buffer_pool::{BufferPool, BufferPoolStats, PooledBuffer};
pub use chunk_store::{ChunkReader, ChunkStorage, ChunkStore, LocalChunkStorage};
pub use combiner::{Combiner, StagedArtifact};
pub use engine::{EngineOptions, EngineStats, UploadEngine};
pub use gc::{CleanupReport, GarbageCollector};
pub use tracker::{Arrival, CombineClaim, ExpiredSession, SessionHandle, StaleSession, UploadTracker};
pub use types::*;
pub use verifier::{compute_hash, IntegrityVerifier};
