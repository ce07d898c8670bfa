//! Reference client: splits a file and uploads it chunk by chunk.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::{self, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunk_upload_server::routes::upload::{
    HEADER_CHECKSUM, HEADER_CHUNK_INDEX, HEADER_FILENAME, HEADER_TOTAL_CHUNK,
};
use chunk_upload_server::upload::{compute_hash, ChunkReceipt, SessionState};

#[derive(Parser)]
#[command(name = "chunk-client")]
#[command(about = "Upload a file to the chunk upload server")]
struct Cli {
    /// Server base URL
    #[arg(long, default_value = "http://localhost:4000")]
    server: String,

    /// File to upload
    #[arg(short, long)]
    file: PathBuf,

    /// Number of chunks to split the file into
    #[arg(short, long, default_value_t = 100)]
    chunks: usize,

    /// Upload name (defaults to the file name)
    #[arg(short, long)]
    name: Option<String>,

    /// Chunks in flight at once
    #[arg(short, long, default_value_t = 1)]
    parallel: usize,
}

#[derive(Deserialize)]
struct ChunkUploadResponse {
    #[serde(flatten)]
    receipt: ChunkReceipt,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chunk_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let name = match cli.name {
        Some(name) => name,
        None => cli
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .context("file has no usable name, pass --name")?,
    };

    let data = Arc::new(
        tokio::fs::read(&cli.file)
            .await
            .with_context(|| format!("failed to read {}", cli.file.display()))?,
    );
    let checksum = compute_hash(&data);
    let ranges = chunk_ranges(data.len(), cli.chunks);
    let total = ranges.len();

    tracing::info!(
        file = %cli.file.display(),
        name = %name,
        size = data.len(),
        chunks = total,
        checksum = %checksum,
        "Uploading"
    );

    let url = upload_url(&cli.server)?;
    let http = reqwest::Client::new();

    let results: Vec<Result<ChunkReceipt>> = stream::iter(ranges.into_iter().enumerate())
        .map(|(index, range)| {
            let http = http.clone();
            let url = url.clone();
            let data = data.clone();
            let name = name.clone();
            let checksum = checksum.clone();
            async move {
                let body = data[range].to_vec();
                let request = http
                    .post(url)
                    .header(HEADER_FILENAME, name)
                    .header(HEADER_CHECKSUM, checksum)
                    .header(HEADER_CHUNK_INDEX, index.to_string())
                    .header(HEADER_TOTAL_CHUNK, total.to_string())
                    .body(body);
                send_chunk(request)
                    .await
                    .with_context(|| format!("chunk {index} rejected"))
            }
        })
        .buffer_unordered(cli.parallel.max(1))
        .collect()
        .await;

    let mut final_state = None;
    let mut failures = 0;
    for result in results {
        match result {
            Ok(receipt) => {
                tracing::debug!(
                    chunk_index = receipt.chunk_index,
                    chunks_received = receipt.chunks_received,
                    state = ?receipt.state,
                    "Chunk accepted"
                );
                if receipt.state.is_terminal() {
                    final_state = Some(receipt.state);
                }
            }
            Err(e) => {
                tracing::error!("{:#}", e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {total} chunks failed");
    }

    match final_state {
        Some(SessionState::Verified) => {
            tracing::info!(name = %name, "Upload verified");
            Ok(())
        }
        other => anyhow::bail!("upload did not complete, final state: {other:?}"),
    }
}

async fn send_chunk(request: reqwest::RequestBuilder) -> Result<ChunkReceipt> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("server error ({}): {}", status, body);
    }
    let parsed: ChunkUploadResponse = serde_json::from_str(&body)?;
    Ok(parsed.receipt)
}

/// Chunk endpoint under `server`, keeping any path prefix it carries
fn upload_url(server: &str) -> Result<Url> {
    let mut base = Url::parse(server).context("invalid server URL")?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("v1/file/chunk")
        .context("failed to build upload URL")
}

/// Byte ranges for `chunks` pieces of a `len` byte file.
///
/// Every piece gets `len / chunks` bytes and the last one also takes the
/// remainder. Fewer pieces are produced when the file is too small to give
/// each one a byte; an empty file is a single empty piece.
fn chunk_ranges(len: usize, chunks: usize) -> Vec<Range<usize>> {
    let chunks = chunks.clamp(1, len.max(1));
    let size = len / chunks;

    (0..chunks)
        .map(|i| {
            let start = i * size;
            let end = if i + 1 == chunks { len } else { start + size };
            start..end
        })
        .collect()
}
