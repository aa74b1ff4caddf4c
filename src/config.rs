//! Configuration management for the study execution engine.
//!
//! Centralized configuration handling with validation, environment variable
//! overlays, and secure defaults — grounded on the teacher's `config`
//! module, which loads the same way (`from_env`, `from_file`, `validate`)
//! for its own `ApiConfig`/`DatabaseConfig`/`LoggingConfig`.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use thiserror::Error;

use crate::metrics::MetricsConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("configuration parsing error: {message}")]
    ParseError { message: String },
}

/// Top-level engine configuration (§2 expansion: "a Config document loaded
/// from defaults, an optional TOML file, and environment variable
/// overlays").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub blob_store: BlobStoreConfig,
    pub llm: LlmProviderConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub concurrency: ConcurrencyConfig,
}

/// Persistence backend configuration. The only implementation is
/// `SqliteStore`; there is nothing to select between yet, but the document
/// still carries the path the way the teacher carries `DatabaseConfig.url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file, or `:memory:` for an ephemeral
    /// store (tests, local development).
    pub sqlite_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "./study_engine.sqlite3".to_string(),
        }
    }
}

/// Broker backend selection (§4.1 expansion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub backend: BrokerBackend,
    /// Redis connection URL, required when `backend` is `Redis`.
    pub redis_url: Option<String>,
    /// Grace period for in-flight handlers to drain on shutdown.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    InMemory,
    Redis,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::InMemory,
            redis_url: None,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Blob store backend selection (§4 "Blob Store").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStoreConfig {
    pub backend: BlobStoreBackend,
    /// Root directory for the local backend.
    pub local_root: PathBuf,
    /// Bucket name, required when `backend` is `S3`.
    pub s3_bucket: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BlobStoreBackend {
    Local,
    S3,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            backend: BlobStoreBackend::Local,
            local_root: PathBuf::from("./study_engine_blobs"),
            s3_bucket: None,
        }
    }
}

/// LLM provider selection for the synthetic-execution worker (§4 "LLM
/// Client"). A missing or absent API key falls back to `StubLlmClient`
/// rather than failing startup, mirroring the teacher's "degrade, don't
/// crash" stance on optional model catalogs.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmProviderConfig {
    pub provider: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Per-queue concurrency limits (§5 expansion).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    pub max_concurrent_per_queue: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_queue: 8,
        }
    }
}

impl Config {
    /// Load configuration from environment variables layered over defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = env::var("STUDY_ENGINE_SQLITE_PATH") {
            config.store.sqlite_path = path;
        }

        if let Ok(backend) = env::var("STUDY_ENGINE_BROKER_BACKEND") {
            config.broker.backend = match backend.as_str() {
                "redis" => BrokerBackend::Redis,
                "memory" | "in-memory" => BrokerBackend::InMemory,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "STUDY_ENGINE_BROKER_BACKEND".to_string(),
                        reason: format!("unknown broker backend '{other}'"),
                    })
                }
            };
        }
        if let Ok(url) = env::var("STUDY_ENGINE_REDIS_URL") {
            config.broker.redis_url = Some(url);
        }

        if let Ok(backend) = env::var("STUDY_ENGINE_BLOB_BACKEND") {
            config.blob_store.backend = match backend.as_str() {
                "s3" => BlobStoreBackend::S3,
                "local" => BlobStoreBackend::Local,
                other => {
                    return Err(ConfigError::InvalidValue {
                        key: "STUDY_ENGINE_BLOB_BACKEND".to_string(),
                        reason: format!("unknown blob store backend '{other}'"),
                    })
                }
            };
        }
        if let Ok(bucket) = env::var("STUDY_ENGINE_S3_BUCKET") {
            config.blob_store.s3_bucket = Some(bucket);
        }
        if let Ok(root) = env::var("STUDY_ENGINE_BLOB_ROOT") {
            config.blob_store.local_root = PathBuf::from(root);
        }

        if let Ok(provider) = env::var("STUDY_ENGINE_LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(key) = env::var("STUDY_ENGINE_LLM_API_KEY") {
            config.llm.api_key = Some(key);
        }

        if let Ok(level) = env::var("STUDY_ENGINE_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }

    /// Load configuration from a TOML file, with no environment overlay
    /// applied (callers compose `from_file` and `from_env` as needed).
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// Validate configuration invariants that can't be expressed in types
    /// alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        if self.broker.backend == BrokerBackend::Redis && self.broker.redis_url.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "broker.redis_url".to_string(),
            });
        }

        if self.blob_store.backend == BlobStoreBackend::S3 && self.blob_store.s3_bucket.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "blob_store.s3_bucket".to_string(),
            });
        }

        if self.concurrency.max_concurrent_per_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "concurrency.max_concurrent_per_queue".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        Ok(())
    }
}
