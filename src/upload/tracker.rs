//! Upload Tracker
//!
//! In-memory session table keyed by upload ID. It is the only authority on
//! which chunk indices have arrived; the chunk directory is never scanned to
//! decide completeness.
//!
//! Locking:
//! - the table lock guards insertion and removal of sessions
//! - each session has its own lock, created with the session and dropped
//!   with it on purge, so unrelated uploads never contend
//! - lock order is always table, then session
//!
//! The transition out of `Receiving` happens under the session lock and
//! hands exactly one caller a [`CombineClaim`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::types::{
    ChunkMeta, SessionSnapshot, SessionState, UploadError, DEFAULT_MAX_TOTAL_CHUNKS,
};

// ============================================================================
// Session
// ============================================================================

/// State of one upload
#[derive(Debug)]
struct UploadSession {
    upload_id: String,
    total_chunks: usize,
    expected_checksum: String,
    /// One flag per index in `0..total_chunks`
    received: Vec<bool>,
    state: SessionState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UploadSession {
    fn new(upload_id: &str, total_chunks: usize, expected_checksum: String) -> Self {
        let now = Utc::now();
        Self {
            upload_id: upload_id.to_string(),
            total_chunks,
            expected_checksum,
            received: vec![false; total_chunks],
            state: SessionState::Receiving,
            created_at: now,
            updated_at: now,
        }
    }

    fn received_count(&self) -> usize {
        self.received.iter().filter(|r| **r).count()
    }

    /// Every index in `0..total_chunks` has arrived
    fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    fn missing_chunks(&self) -> Vec<usize> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, r)| !**r)
            .map(|(i, _)| i)
            .collect()
    }

    /// Reject a submission that disagrees with what the session pinned
    fn check_consistent(&self, meta: &ChunkMeta, checksum: &str) -> Result<(), UploadError> {
        if meta.total_chunks != self.total_chunks {
            return Err(UploadError::TotalChunksMismatch {
                upload_id: self.upload_id.clone(),
                expected: self.total_chunks,
                actual: meta.total_chunks,
            });
        }
        if checksum != self.expected_checksum {
            return Err(UploadError::ChecksumConflict {
                upload_id: self.upload_id.clone(),
                expected: self.expected_checksum.clone(),
                actual: checksum.to_string(),
            });
        }
        Ok(())
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            upload_id: self.upload_id.clone(),
            state: self.state,
            total_chunks: self.total_chunks,
            chunks_received: self.received_count(),
            missing_chunks: self.missing_chunks(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Shared handle on one tracked session
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<Mutex<UploadSession>>,
}

impl SessionHandle {
    pub fn upload_id(&self) -> String {
        self.session.lock().upload_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().snapshot()
    }

    fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.session, &other.session)
    }
}

/// Outcome of registering one chunk index
pub struct Arrival {
    /// Session state after the arrival
    pub state: SessionState,
    /// Distinct indices received
    pub chunks_received: usize,
    /// Total chunks expected
    pub total_chunks: usize,
    /// The index had already been registered
    pub duplicate: bool,
    /// Set for exactly one arrival per session: the one that completed it
    pub claim: Option<CombineClaim>,
}

/// Arrival registered against a session that already reached a terminal
/// state and was purged; the caller should resubmit against a fresh session.
#[derive(Debug)]
pub struct StaleSession;

/// Session dropped for inactivity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredSession {
    pub upload_id: String,
    pub total_chunks: usize,
}

// ============================================================================
// Upload Tracker
// ============================================================================

/// Tracks per-upload state and serialises the completion-to-combine step
#[derive(Clone)]
pub struct UploadTracker {
    inner: Arc<UploadTrackerInner>,
}

struct UploadTrackerInner {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    /// Largest `total_chunks` a session may pin
    max_total_chunks: usize,
}

impl UploadTracker {
    pub fn new() -> Self {
        Self::with_max_total_chunks(DEFAULT_MAX_TOTAL_CHUNKS)
    }

    pub fn with_max_total_chunks(max_total_chunks: usize) -> Self {
        Self {
            inner: Arc::new(UploadTrackerInner {
                sessions: Mutex::new(HashMap::new()),
                max_total_chunks,
            }),
        }
    }

    // ========================================================================
    // Arrival
    // ========================================================================

    /// Validate a submission and return the session it belongs to.
    ///
    /// Creates the session on the first chunk for an unseen upload ID, which
    /// pins `total_chunks` and the expected checksum. Nothing is mutated when
    /// validation fails. Does not register the index; see
    /// [`UploadTracker::mark_received`].
    pub fn admit(&self, meta: &ChunkMeta) -> Result<SessionHandle, UploadError> {
        let checksum = meta.validate(self.inner.max_total_chunks)?;

        let mut sessions = self.inner.sessions.lock();

        if let Some(handle) = sessions.get(&meta.upload_id) {
            handle.session.lock().check_consistent(meta, &checksum)?;
            return Ok(handle.clone());
        }

        let handle = SessionHandle {
            session: Arc::new(Mutex::new(UploadSession::new(
                &meta.upload_id,
                meta.total_chunks,
                checksum,
            ))),
        };
        sessions.insert(meta.upload_id.clone(), handle.clone());

        tracing::info!(
            upload_id = %meta.upload_id,
            total_chunks = meta.total_chunks,
            "Created upload session"
        );

        Ok(handle)
    }

    /// Register an index as received on an admitted session
    pub fn mark_received(
        &self,
        handle: &SessionHandle,
        index: usize,
    ) -> Result<Arrival, StaleSession> {
        let mut session = handle.session.lock();

        if session.state.is_terminal() {
            return Err(StaleSession);
        }

        let total_chunks = session.total_chunks;
        // admit() bounds the index against this session's total
        let duplicate = match session.received.get_mut(index) {
            Some(slot) if !*slot => {
                *slot = true;
                false
            }
            _ => true,
        };
        if !duplicate {
            session.updated_at = Utc::now();
        }

        let mut claim = None;
        if session.state == SessionState::Receiving && session.is_complete() {
            session.state = SessionState::Combining;
            claim = Some(CombineClaim {
                tracker: self.clone(),
                handle: handle.clone(),
                upload_id: session.upload_id.clone(),
                total_chunks,
                expected_checksum: session.expected_checksum.clone(),
                finished: false,
            });

            tracing::info!(
                upload_id = %session.upload_id,
                total_chunks = total_chunks,
                "All chunks received, claimed combine"
            );
        }

        Ok(Arrival {
            state: session.state,
            chunks_received: session.received_count(),
            total_chunks,
            duplicate,
            claim,
        })
    }

    /// Admit and register in one step
    #[cfg(test)]
    pub fn record_arrival(&self, meta: &ChunkMeta) -> Result<Arrival, UploadError> {
        loop {
            let handle = self.admit(meta)?;
            if let Ok(arrival) = self.mark_received(&handle, meta.index) {
                return Ok(arrival);
            }
        }
    }

    // ========================================================================
    // Query Methods
    // ========================================================================

    /// Current view of a tracked session
    pub fn snapshot(&self, upload_id: &str) -> Option<SessionSnapshot> {
        let handle = self.inner.sessions.lock().get(upload_id).cloned()?;
        Some(handle.snapshot())
    }

    /// Number of tracked sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    // ========================================================================
    // Cleanup
    // ========================================================================

    /// Drop `Receiving` sessions with no new chunk for at least `max_idle`.
    ///
    /// Sessions that are combining or verifying belong to a claim and are
    /// left alone. Returns what was dropped so its chunks can be collected.
    pub fn expire_idle(&self, max_idle: Duration) -> Vec<ExpiredSession> {
        let Some(cutoff) = chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        else {
            return Vec::new();
        };

        let mut sessions = self.inner.sessions.lock();
        let mut expired = Vec::new();

        sessions.retain(|upload_id, handle| {
            let mut session = handle.session.lock();
            if session.state != SessionState::Receiving || session.updated_at > cutoff {
                return true;
            }

            session.state = SessionState::Failed;
            session.updated_at = Utc::now();
            expired.push(ExpiredSession {
                upload_id: upload_id.clone(),
                total_chunks: session.total_chunks,
            });
            false
        });

        for session in &expired {
            tracing::debug!(upload_id = %session.upload_id, "Expired idle upload session");
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired idle upload sessions");
        }

        expired
    }

    // ========================================================================
    // Terminal Transitions
    // ========================================================================

    /// Set a terminal state and drop the session from the table
    fn finish(&self, handle: &SessionHandle, state: SessionState) {
        debug_assert!(state.is_terminal());

        let mut sessions = self.inner.sessions.lock();
        let upload_id = {
            let mut session = handle.session.lock();
            session.state = state;
            session.updated_at = Utc::now();
            session.upload_id.clone()
        };

        if sessions
            .get(&upload_id)
            .is_some_and(|current| current.same_session(handle))
        {
            sessions.remove(&upload_id);
        }

        tracing::debug!(upload_id = %upload_id, state = ?state, "Purged upload session");
    }
}

// ============================================================================
// Combine Claim
// ============================================================================

/// Exclusive right to combine and verify one completed session.
///
/// Dropping a claim without calling [`CombineClaim::finish`] marks the
/// session failed so the upload ID is not left stuck in `Combining`.
pub struct CombineClaim {
    tracker: UploadTracker,
    handle: SessionHandle,
    upload_id: String,
    total_chunks: usize,
    expected_checksum: String,
    finished: bool,
}

impl CombineClaim {
    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn expected_checksum(&self) -> &str {
        &self.expected_checksum
    }

    /// Combining -> Verifying
    pub fn begin_verifying(&self) {
        let mut session = self.handle.session.lock();
        session.state = SessionState::Verifying;
        session.updated_at = Utc::now();
    }

    /// Move to a terminal state and release the upload ID
    pub fn finish(mut self, state: SessionState) {
        self.finished = true;
        self.tracker.finish(&self.handle, state);
    }
}

impl Drop for CombineClaim {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                upload_id = %self.upload_id,
                "Combine claim dropped before completion, failing session"
            );
            self.tracker.finish(&self.handle, SessionState::Failed);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
