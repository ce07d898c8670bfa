//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::upload::UploadEngine;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    engine: UploadEngine,
}

impl AppState {
    /// Create state with an engine built from the configuration
    pub fn new(config: Config) -> Self {
        let engine = UploadEngine::new(config.engine_options());
        Self::with_engine(config, engine)
    }

    /// Create state around an existing engine
    pub fn with_engine(config: Config, engine: UploadEngine) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, engine }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload engine
    pub fn engine(&self) -> &UploadEngine {
        &self.inner.engine
    }
}
