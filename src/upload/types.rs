//! Upload types for chunk reassembly

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Default copy buffer size: 64KB
pub const DEFAULT_COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest copy buffer accepted from configuration
pub const MIN_COPY_BUFFER_SIZE: usize = 4 * 1024;

/// Default number of idle buffers retained by the pool
pub const DEFAULT_BUFFER_POOL_SIZE: usize = 16;

/// Length of a hex-encoded SHA-256 digest
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Default cap on `total-chunk`
pub const DEFAULT_MAX_TOTAL_CHUNKS: usize = 100_000;

/// Session idle expiry time: 24 hours
pub const DEFAULT_SESSION_IDLE_SECS: u64 = 24 * 60 * 60;

/// Longest file name accepted by common filesystems (NAME_MAX)
pub const FILE_NAME_MAX: usize = 255;

/// Bytes a chunk temp name adds around the upload ID:
/// `.` + `-chunk-` + index (at most 20 digits) + `.tmp.` + UUID
pub const CHUNK_TEMP_NAME_OVERHEAD: usize = 1 + 7 + 20 + 5 + 36;

/// Longest upload ID accepted; every file name derived from it must still
/// fit in `FILE_NAME_MAX`
pub const MAX_UPLOAD_ID_LEN: usize = FILE_NAME_MAX - CHUNK_TEMP_NAME_OVERHEAD;

// ============================================================================
// Submission Types
// ============================================================================

/// Header fields of one chunk submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMeta {
    /// Upload identifier (the target filename)
    pub upload_id: String,

    /// Zero-based chunk index
    pub index: usize,

    /// Number of chunks in the complete file
    pub total_chunks: usize,

    /// Hex SHA-256 of the fully reassembled file
    pub expected_checksum: String,
}

impl ChunkMeta {
    pub fn new(
        upload_id: impl Into<String>,
        index: usize,
        total_chunks: usize,
        expected_checksum: impl Into<String>,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            index,
            total_chunks,
            expected_checksum: expected_checksum.into(),
        }
    }

    /// Check field-level constraints that need no session context.
    ///
    /// Returns the checksum normalised to lowercase.
    pub fn validate(&self, max_total_chunks: usize) -> Result<String, UploadError> {
        validate_upload_id(&self.upload_id)?;

        if self.total_chunks == 0 {
            return Err(UploadError::InvalidHeader {
                header: "total-chunk",
                reason: "must be a positive integer".to_string(),
            });
        }

        if self.total_chunks > max_total_chunks {
            return Err(UploadError::InvalidHeader {
                header: "total-chunk",
                reason: format!("must not exceed {max_total_chunks}"),
            });
        }

        if self.index >= self.total_chunks {
            return Err(UploadError::IndexOutOfRange {
                index: self.index,
                total: self.total_chunks,
            });
        }

        normalize_checksum(&self.expected_checksum)
    }
}

/// Reject upload IDs that cannot safely be used as a file name
pub fn validate_upload_id(upload_id: &str) -> Result<(), UploadError> {
    let reason = if upload_id.is_empty() {
        Some("must not be empty")
    } else if upload_id.len() > MAX_UPLOAD_ID_LEN {
        Some("is too long")
    } else if upload_id.contains(['/', '\\', '\0']) {
        Some("must not contain path separators")
    } else if upload_id.starts_with('.') {
        Some("must not start with '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(UploadError::InvalidUploadId {
            upload_id: upload_id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Lowercase a SHA-256 hex digest, rejecting anything else
pub fn normalize_checksum(checksum: &str) -> Result<String, UploadError> {
    let trimmed = checksum.trim();
    if trimmed.len() != CHECKSUM_HEX_LEN || !trimmed.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UploadError::InvalidChecksum(checksum.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

// ============================================================================
// Outcome Types
// ============================================================================

/// Result of writing one chunk artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The artifact was written by this call
    Stored,
    /// An artifact already existed under this key; nothing was written
    AlreadyPresent,
}

impl PutOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::AlreadyPresent)
    }
}

/// Result of checking the final artifact digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified {
        bytes: u64,
    },
    ChecksumMismatch {
        expected: String,
        actual: String,
    },
}

/// Per-upload state machine
///
/// `New` is implicit: a session only exists once its first chunk is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Waiting for more chunks
    Receiving,
    /// Every index arrived; one caller owns the combine step
    Combining,
    /// Final artifact assembled, digest being checked
    Verifying,
    /// Final artifact promoted (terminal)
    Verified,
    /// Upload rejected (terminal)
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

/// Response body after a chunk is accepted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReceipt {
    /// Upload the chunk belongs to
    pub filename: String,

    /// Chunk index that was submitted
    pub chunk_index: usize,

    /// Total chunks expected
    pub total_chunks: usize,

    /// Distinct chunks received so far
    pub chunks_received: usize,

    /// Whether the chunk was already stored
    pub duplicate: bool,

    /// Session state after this submission
    pub state: SessionState,
}

/// Point-in-time view of a tracked session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub upload_id: String,
    pub state: SessionState,
    pub total_chunks: usize,
    pub chunks_received: usize,
    pub missing_chunks: Vec<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid header {header}: {reason}")]
    InvalidHeader {
        header: &'static str,
        reason: String,
    },

    #[error("Invalid upload id {upload_id:?}: {reason}")]
    InvalidUploadId {
        upload_id: String,
        reason: &'static str,
    },

    #[error("Invalid checksum {0:?}: expected {CHECKSUM_HEX_LEN} hex characters")]
    InvalidChecksum(String),

    #[error("Chunk index out of range: {index} (total: {total})")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("Total chunk mismatch for {upload_id}: session has {expected}, got {actual}")]
    TotalChunksMismatch {
        upload_id: String,
        expected: usize,
        actual: usize,
    },

    #[error("Checksum conflict for {upload_id}: session expects {expected}, got {actual}")]
    ChecksumConflict {
        upload_id: String,
        expected: String,
        actual: String,
    },

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Inconsistent state for {upload_id}: chunk {index} missing at combine time")]
    InconsistentState { upload_id: String, index: usize },

    #[error("Checksum mismatch for {upload_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        upload_id: String,
        expected: String,
        actual: String,
    },

    #[error("Finalizing {upload_id} failed: {source}")]
    FinalizeFailed {
        upload_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    /// Whether the submission was rejected before any storage mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingHeader(_)
                | Self::InvalidHeader { .. }
                | Self::InvalidUploadId { .. }
                | Self::InvalidChecksum(_)
                | Self::IndexOutOfRange { .. }
                | Self::TotalChunksMismatch { .. }
                | Self::ChecksumConflict { .. }
        )
    }

    /// Get HTTP status code for this error
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InconsistentState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::FinalizeFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ChecksumMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingHeader(_) => "MISSING_HEADER",
            Self::InvalidHeader { .. } => "INVALID_HEADER",
            Self::InvalidUploadId { .. } => "INVALID_UPLOAD_ID",
            Self::InvalidChecksum(_) => "INVALID_CHECKSUM",
            Self::IndexOutOfRange { .. } => "CHUNK_INDEX_OUT_OF_RANGE",
            Self::TotalChunksMismatch { .. } => "TOTAL_CHUNK_MISMATCH",
            Self::ChecksumConflict { .. } => "CHECKSUM_CONFLICT",
            Self::Io(_) => "STORAGE_ERROR",
            Self::InconsistentState { .. } => "INCONSISTENT_STATE",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::FinalizeFailed { .. } => "FINALIZE_FAILED",
        }
    }

    /// Session state implied by this error, if the upload was affected
    pub fn session_state(&self) -> Option<SessionState> {
        match self {
            Self::InconsistentState { .. }
            | Self::ChecksumMismatch { .. }
            | Self::FinalizeFailed { .. } => Some(SessionState::Failed),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "1f8ac10f23c5b5bc1167bda84b833e5c057a77d2c4f1b8e1a5e0e7f6a0a0b0c0";

    #[test]
    fn test_checksum_is_lowercased() {
        let upper = DIGEST.to_ascii_uppercase();
        assert_eq!(normalize_checksum(&upper).unwrap(), DIGEST);
    }

    #[test]
    fn test_checksum_rejects_wrong_length_and_non_hex() {
        assert!(matches!(
            normalize_checksum("abc123"),
            Err(UploadError::InvalidChecksum(_))
        ));
        let bad = format!("{}zz", &DIGEST[..62]);
        assert!(normalize_checksum(&bad).is_err());
    }

    #[test]
    fn test_upload_id_rules() {
        assert!(validate_upload_id("photo.jpeg").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "a\\b", "nul\0byte"] {
            assert!(
                matches!(validate_upload_id(bad), Err(UploadError::InvalidUploadId { .. })),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_upload_id(&"x".repeat(MAX_UPLOAD_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_meta_validation() {
        let meta = ChunkMeta::new("file.bin", 3, 3, DIGEST);
        assert!(matches!(
            meta.validate(DEFAULT_MAX_TOTAL_CHUNKS),
            Err(UploadError::IndexOutOfRange { index: 3, total: 3 })
        ));

        let meta = ChunkMeta::new("file.bin", 0, 0, DIGEST);
        assert!(matches!(
            meta.validate(DEFAULT_MAX_TOTAL_CHUNKS),
            Err(UploadError::InvalidHeader { .. })
        ));

        let meta = ChunkMeta::new("file.bin", 2, 3, DIGEST);
        assert_eq!(meta.validate(DEFAULT_MAX_TOTAL_CHUNKS).unwrap(), DIGEST);
    }

    #[test]
    fn test_total_chunks_capped() {
        for total in [usize::MAX, 1usize << 46, 11] {
            let meta = ChunkMeta::new("huge.bin", 0, total, DIGEST);
            assert!(matches!(
                meta.validate(10),
                Err(UploadError::InvalidHeader { header: "total-chunk", .. })
            ));
        }
        assert!(ChunkMeta::new("huge.bin", 9, 10, DIGEST).validate(10).is_ok());
    }

    #[test]
    fn test_longest_upload_id_fits_every_file_name() {
        let id = "x".repeat(MAX_UPLOAD_ID_LEN);
        assert!(validate_upload_id(&id).is_ok());

        let uuid = uuid::Uuid::new_v4();
        let chunk_temp = format!(".{id}-chunk-{}.tmp.{uuid}", usize::MAX);
        let partial = format!(".{id}.partial.{uuid}");
        assert!(chunk_temp.len() <= FILE_NAME_MAX);
        assert!(partial.len() <= FILE_NAME_MAX);
    }

    #[test]
    fn test_error_classification() {
        let err = UploadError::ChecksumMismatch {
            upload_id: "f".into(),
            expected: "a".into(),
            actual: "b".into(),
        };
        assert!(!err.is_validation());
        assert_eq!(err.status_code(), axum::http::StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(err.session_state(), Some(SessionState::Failed));

        let err = UploadError::FinalizeFailed {
            upload_id: "f".into(),
            source: std::io::Error::other("disk gone"),
        };
        assert!(!err.is_validation());
        assert_eq!(err.code(), "FINALIZE_FAILED");
        assert_eq!(err.session_state(), Some(SessionState::Failed));

        let err = UploadError::MissingHeader("filename");
        assert!(err.is_validation());
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
