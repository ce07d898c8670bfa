//! Health check endpoints

use axum::{extract::State, Json};
use serde::Serialize;

use crate::state::AppState;
use crate::upload::{BufferPoolStats, EngineStats};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub service: &'static str,
    pub engine: EngineStats,
    pub buffers: BufferPoolStats,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        service: "chunk-upload-server",
        engine: state.engine().stats(),
        buffers: state.engine().buffer_stats(),
    })
}
