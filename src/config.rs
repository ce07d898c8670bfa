//! Configuration management for the chunk upload server

use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::upload::{
    EngineOptions, DEFAULT_BUFFER_POOL_SIZE, DEFAULT_COPY_BUFFER_SIZE, DEFAULT_MAX_TOTAL_CHUNKS,
    DEFAULT_SESSION_IDLE_SECS, MIN_COPY_BUFFER_SIZE,
};

/// Default request body limit: 64MB
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },

    #[error("{key} must be at least {min}, got {value}")]
    TooSmall {
        key: &'static str,
        min: usize,
        value: usize,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub mode: RunMode,
    /// Largest accepted request body (one chunk)
    pub max_chunk_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Dev,
    Prod,
}

impl RunMode {
    /// Log filter used when `RUST_LOG` is unset
    pub fn default_log_filter(self) -> &'static str {
        match self {
            RunMode::Dev => "chunk_upload_server=debug,tower_http=debug",
            RunMode::Prod => "chunk_upload_server=info,tower_http=info",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub chunk_dir: PathBuf,
    pub final_dir: PathBuf,
    pub copy_buffer_size: usize,
    pub buffer_pool_size: usize,
    /// Largest `total-chunk` a new upload may declare
    pub max_total_chunks: usize,
    /// Seconds a receiving upload may go without a new chunk
    pub session_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 4000,
                mode: RunMode::Dev,
                max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            },
            storage: StorageConfig {
                chunk_dir: PathBuf::from("./storage/chunks"),
                final_dir: PathBuf::from("./storage/final"),
                copy_buffer_size: DEFAULT_COPY_BUFFER_SIZE,
                buffer_pool_size: DEFAULT_BUFFER_POOL_SIZE,
                max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
                session_idle_timeout_secs: DEFAULT_SESSION_IDLE_SECS,
            },
        }
    }
}

impl Config {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup; unset keys take defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let mode = match lookup("MODE").as_deref().map(str::trim) {
            None | Some("") | Some("dev") | Some("debug") => RunMode::Dev,
            Some("prod") | Some("release") => RunMode::Prod,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "MODE",
                    value: other.to_string(),
                })
            }
        };

        let copy_buffer_size = parse_or(&lookup, "COPY_BUFFER_SIZE", defaults.storage.copy_buffer_size)?;
        if copy_buffer_size < MIN_COPY_BUFFER_SIZE {
            return Err(ConfigError::TooSmall {
                key: "COPY_BUFFER_SIZE",
                min: MIN_COPY_BUFFER_SIZE,
                value: copy_buffer_size,
            });
        }

        // SERVER_PORT wins; PORT is what most hosting platforms inject
        let port = match lookup("SERVER_PORT") {
            Some(_) => parse_or(&lookup, "SERVER_PORT", defaults.server.port)?,
            None => parse_or(&lookup, "PORT", defaults.server.port)?,
        };

        Ok(Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port,
                mode,
                max_chunk_size: parse_or(
                    &lookup,
                    "MAX_CHUNK_SIZE",
                    defaults.server.max_chunk_size,
                )?,
            },
            storage: StorageConfig {
                chunk_dir: lookup("FOLDER_UPLOAD_CHUNK")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.chunk_dir),
                final_dir: lookup("FOLDER_UPLOAD_FINAL")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.final_dir),
                copy_buffer_size,
                buffer_pool_size: parse_or(
                    &lookup,
                    "BUFFER_POOL_SIZE",
                    defaults.storage.buffer_pool_size,
                )?,
                max_total_chunks: parse_or(
                    &lookup,
                    "MAX_TOTAL_CHUNKS",
                    defaults.storage.max_total_chunks,
                )?,
                session_idle_timeout_secs: parse_or(
                    &lookup,
                    "SESSION_IDLE_TIMEOUT_SECS",
                    defaults.storage.session_idle_timeout_secs,
                )?,
            },
        })
    }

    /// Engine parameters derived from the storage section
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            chunk_dir: self.storage.chunk_dir.clone(),
            final_dir: self.storage.final_dir.clone(),
            copy_buffer_size: self.storage.copy_buffer_size,
            buffer_pool_size: self.storage.buffer_pool_size,
            max_total_chunks: self.storage.max_total_chunks,
            session_idle_timeout: Duration::from_secs(self.storage.session_idle_timeout_secs),
        }
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
