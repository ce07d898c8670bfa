//! Upload Routes
//!
//! HTTP surface of the chunk reassembly engine.
//!
//! Endpoints:
//! - POST /v1/file/chunk - Upload one chunk; metadata travels in headers
//! - GET /v1/file/chunk/:filename - Progress of an upload still in flight
//!
//! Chunk headers:
//! - `filename`: upload ID, also the final file name
//! - `check-sum`: hex SHA-256 of the whole reassembled file
//! - `chunk-index`: zero-based index of this chunk
//! - `total-chunk`: number of chunks in the upload

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{ChunkMeta, ChunkReceipt, SessionSnapshot, SessionState, UploadError};

pub const HEADER_FILENAME: &str = "filename";
pub const HEADER_CHECKSUM: &str = "check-sum";
pub const HEADER_CHUNK_INDEX: &str = "chunk-index";
pub const HEADER_TOTAL_CHUNK: &str = "total-chunk";

// ============================================================================
// Responses
// ============================================================================

#[derive(Serialize)]
pub struct ChunkUploadResponse {
    pub message: &'static str,
    #[serde(flatten)]
    pub receipt: ChunkReceipt,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<SessionState>,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if self.is_validation() {
            tracing::warn!(code = self.code(), error = %self, "Chunk rejected");
        } else {
            tracing::error!(code = self.code(), error = %self, "Upload failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
            state: self.session_state(),
        });

        (status, body).into_response()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/chunk", post(upload_chunk))
        .route("/chunk/:filename", get(session_status))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /v1/file/chunk
///
/// Store one chunk. The response for the chunk that completes an upload is
/// sent after the file has been reassembled and verified.
async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let meta = parse_chunk_headers(&headers)?;

    tracing::debug!(
        upload_id = %meta.upload_id,
        chunk_index = meta.index,
        total_chunks = meta.total_chunks,
        size = body.len(),
        "Received chunk"
    );

    let receipt = state.engine().submit_chunk(meta, &body).await?;

    Ok(Json(ChunkUploadResponse {
        message: "success upload",
        receipt,
    }))
}

/// GET /v1/file/chunk/:filename
async fn session_status(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Response {
    match state.engine().session(&filename) {
        Some(snapshot) => Json::<SessionSnapshot>(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("No upload in progress for {filename:?}"),
                code: "SESSION_NOT_FOUND",
                state: None,
            }),
        )
            .into_response(),
    }
}

// ============================================================================
// Header Parsing
// ============================================================================

/// Build chunk metadata from request headers.
///
/// Only presence and number syntax are checked here; the engine validates
/// the values themselves.
pub fn parse_chunk_headers(headers: &HeaderMap) -> Result<ChunkMeta, UploadError> {
    let upload_id = header_str(headers, HEADER_FILENAME)?;
    let checksum = header_str(headers, HEADER_CHECKSUM)?;
    let index = header_number(headers, HEADER_CHUNK_INDEX)?;
    let total_chunks = header_number(headers, HEADER_TOTAL_CHUNK)?;

    Ok(ChunkMeta::new(upload_id, index, total_chunks, checksum))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, UploadError> {
    let value = headers
        .get(name)
        .ok_or(UploadError::MissingHeader(name))?
        .to_str()
        .map_err(|_| UploadError::InvalidHeader {
            header: name,
            reason: "not visible ASCII".to_string(),
        })?
        .trim();

    if value.is_empty() {
        return Err(UploadError::MissingHeader(name));
    }
    Ok(value)
}

fn header_number(headers: &HeaderMap, name: &'static str) -> Result<usize, UploadError> {
    let value = header_str(headers, name)?;
    value.parse().map_err(|_| UploadError::InvalidHeader {
        header: name,
        reason: format!("{value:?} is not a non-negative integer"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::upload::{compute_hash, EngineOptions, UploadEngine};
    use axum::http::{HeaderName, HeaderValue};
    use axum_test::TestServer;
    use serde_json::Value;
    use tempfile::TempDir;

    fn server(dir: &TempDir) -> (TestServer, UploadEngine) {
        let engine = UploadEngine::new(EngineOptions::new(
            dir.path().join("chunks"),
            dir.path().join("final"),
        ));
        let state = AppState::with_engine(Config::default(), engine.clone());
        (TestServer::new(crate::app(state)).unwrap(), engine)
    }

    fn headers(filename: &str, checksum: &str, index: &str, total: &str) -> Vec<(HeaderName, HeaderValue)> {
        vec![
            (HeaderName::from_static(HEADER_FILENAME), HeaderValue::from_str(filename).unwrap()),
            (HeaderName::from_static(HEADER_CHECKSUM), HeaderValue::from_str(checksum).unwrap()),
            (HeaderName::from_static(HEADER_CHUNK_INDEX), HeaderValue::from_str(index).unwrap()),
            (HeaderName::from_static(HEADER_TOTAL_CHUNK), HeaderValue::from_str(total).unwrap()),
        ]
    }

    async fn post_chunk(
        server: &TestServer,
        headers: Vec<(HeaderName, HeaderValue)>,
        body: &'static [u8],
    ) -> axum_test::TestResponse {
        let mut request = server.post("/v1/file/chunk");
        for (name, value) in headers {
            request = request.add_header(name, value);
        }
        request.bytes(Bytes::from_static(body)).await
    }

    #[tokio::test]
    async fn test_upload_hello_world() {
        let dir = TempDir::new().unwrap();
        let (server, engine) = server(&dir);
        let checksum = compute_hash(b"HELLOWORLD");

        let response = post_chunk(&server, headers("hello.txt", &checksum, "2", "3"), b"LD").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["message"], "success upload");
        assert_eq!(body["state"], "receiving");
        assert_eq!(body["chunksReceived"], 1);

        let status = server.get("/v1/file/chunk/hello.txt").await;
        status.assert_status_ok();
        let snapshot: Value = status.json();
        assert_eq!(snapshot["missingChunks"], serde_json::json!([0, 1]));

        post_chunk(&server, headers("hello.txt", &checksum, "0", "3"), b"HELL")
            .await
            .assert_status_ok();
        let response = post_chunk(&server, headers("hello.txt", &checksum, "1", "3"), b"OWOR").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["state"], "verified");
        assert_eq!(body["filename"], "hello.txt");

        assert_eq!(std::fs::read(engine.final_path("hello.txt")).unwrap(), b"HELLOWORLD");
        server
            .get("/v1/file/chunk/hello.txt")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_missing_and_malformed_headers() {
        let dir = TempDir::new().unwrap();
        let (server, _engine) = server(&dir);
        let checksum = compute_hash(b"x");

        let mut partial = headers("a", &checksum, "0", "1");
        partial.retain(|(name, _)| name != HEADER_CHECKSUM);
        let response = post_chunk(&server, partial, b"x").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "MISSING_HEADER");

        let response = post_chunk(&server, headers("a", &checksum, "-1", "1"), b"x").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "INVALID_HEADER");

        let response = post_chunk(&server, headers("a", &checksum, "1", "1"), b"x").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "CHUNK_INDEX_OUT_OF_RANGE");

        let response = post_chunk(&server, headers("../a", &checksum, "0", "1"), b"x").await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["code"], "INVALID_UPLOAD_ID");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_reports_failed() {
        let dir = TempDir::new().unwrap();
        let (server, engine) = server(&dir);
        let wrong = compute_hash(b"something else");

        let response = post_chunk(&server, headers("bad.bin", &wrong, "0", "1"), b"data").await;
        response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
        let body: Value = response.json();
        assert_eq!(body["code"], "CHECKSUM_MISMATCH");
        assert_eq!(body["state"], "failed");

        assert!(!engine.final_path("bad.bin").exists());
        assert_eq!(engine.chunk_store().count("bad.bin").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_huge_total_chunk_rejected() {
        let dir = TempDir::new().unwrap();
        let (server, engine) = server(&dir);
        let checksum = compute_hash(b"x");

        for total in ["18446744073709551615", "70368744177664"] {
            let response = post_chunk(&server, headers("huge.bin", &checksum, "0", total), b"x").await;
            response.assert_status(StatusCode::BAD_REQUEST);
            let body: Value = response.json();
            assert_eq!(body["code"], "INVALID_HEADER");
        }

        assert!(engine.session("huge.bin").is_none());
        assert_eq!(engine.chunk_store().count("huge.bin").await.unwrap(), 0);
        server
            .get("/v1/file/chunk/huge.bin")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unwritable_final_path_reports_failed() {
        let dir = TempDir::new().unwrap();
        let (server, engine) = server(&dir);
        let checksum = compute_hash(b"payload");

        // A non-empty directory squats on the final name
        std::fs::create_dir_all(engine.final_path("blocked.bin").join("occupant")).unwrap();

        let response = post_chunk(&server, headers("blocked.bin", &checksum, "0", "1"), b"payload").await;
        response.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json();
        assert_eq!(body["code"], "FINALIZE_FAILED");
        assert_eq!(body["state"], "failed");

        assert!(engine.session("blocked.bin").is_none());
        assert!(engine.final_path("blocked.bin").is_dir());
        assert_eq!(engine.stats().uploads_failed, 1);
    }

    #[tokio::test]
    async fn test_health() {
        let dir = TempDir::new().unwrap();
        let (server, _engine) = server(&dir);

        for path in ["/health", "/v1/health"] {
            let response = server.get(path).await;
            response.assert_status_ok();
            let body: Value = response.json();
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["engine"]["combines"], 0);
        }
    }

    #[test]
    fn test_parse_chunk_headers() {
        let mut map = HeaderMap::new();
        for (name, value) in headers("movie.mp4", &"A".repeat(64), " 7 ", "100") {
            map.insert(name, value);
        }

        let meta = parse_chunk_headers(&map).unwrap();
        assert_eq!(meta.upload_id, "movie.mp4");
        assert_eq!(meta.index, 7);
        assert_eq!(meta.total_chunks, 100);

        map.insert(
            HeaderName::from_static(HEADER_FILENAME),
            HeaderValue::from_static(""),
        );
        assert!(matches!(
            parse_chunk_headers(&map),
            Err(UploadError::MissingHeader(HEADER_FILENAME))
        ));
    }
}
