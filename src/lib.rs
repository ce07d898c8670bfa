//! Chunk Upload Server Library
//!
//! Accepts a file as independently uploaded chunks, reassembles them in index
//! order once every chunk has arrived, and keeps the result only if its
//! SHA-256 matches the digest the client declared.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, session tracking, reassembly and verification
//! - `routes`: HTTP endpoints over the upload engine
//! - `config`: Environment configuration
//! - `state`: Shared application state

pub mod config;
pub mod routes;
pub mod state;
pub mod upload;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    let body_limit = state.config().server.max_chunk_size;

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/v1/health", get(routes::health::health_check))
        .nest("/v1/file", routes::upload::router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
