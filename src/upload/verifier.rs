//! Integrity Verifier
//!
//! Recomputes the SHA-256 of a staged artifact and settles it: promoted on a
//! match, deleted on a mismatch.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;

use super::buffer_pool::BufferPool;
use super::combiner::StagedArtifact;
use super::types::{UploadError, VerifyOutcome};

/// Checks reassembled files against their expected digest
pub struct IntegrityVerifier {
    buffers: Arc<BufferPool>,
}

impl IntegrityVerifier {
    pub fn new(buffers: Arc<BufferPool>) -> Self {
        Self { buffers }
    }

    /// Hash the staged file and compare against `expected_checksum`
    pub async fn verify(
        &self,
        artifact: &StagedArtifact,
        expected_checksum: &str,
    ) -> Result<VerifyOutcome, UploadError> {
        let actual = self.digest_file(artifact.staging_path()).await?;

        if actual.eq_ignore_ascii_case(expected_checksum) {
            Ok(VerifyOutcome::Verified {
                bytes: artifact.size(),
            })
        } else {
            Ok(VerifyOutcome::ChecksumMismatch {
                expected: expected_checksum.to_ascii_lowercase(),
                actual,
            })
        }
    }

    /// Verify, then promote or delete the artifact.
    ///
    /// The artifact never remains on disk unless it was promoted.
    pub async fn verify_and_settle(
        &self,
        artifact: StagedArtifact,
        expected_checksum: &str,
    ) -> Result<VerifyOutcome, UploadError> {
        let outcome = match self.verify(&artifact, expected_checksum).await {
            Ok(outcome) => outcome,
            Err(e) => {
                artifact.discard().await;
                return Err(e);
            }
        };

        match &outcome {
            VerifyOutcome::Verified { bytes } => {
                let upload_id = artifact.upload_id().to_string();
                let path = artifact.promote().await?;
                tracing::info!(
                    upload_id = %upload_id,
                    path = %path.display(),
                    size = bytes,
                    "Checksum verified, final file stored"
                );
            }
            VerifyOutcome::ChecksumMismatch { expected, actual } => {
                tracing::warn!(
                    upload_id = %artifact.upload_id(),
                    expected = %expected,
                    actual = %actual,
                    "Checksum mismatch, rejecting final file"
                );
                artifact.discard().await;
            }
        }

        Ok(outcome)
    }

    /// Streamed SHA-256 of a file, hex encoded
    pub async fn digest_file(&self, path: &Path) -> Result<String, UploadError> {
        let mut file = fs::File::open(path).await?;
        let mut buf = self.buffers.acquire();
        let mut hasher = Sha256::new();

        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
