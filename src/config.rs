//! Configuration loading using Figment.
//!
//! Configuration is layered, later layers win:
//! 1. Built-in defaults
//! 2. A TOML file (default `config/wearsync.toml`, missing file is fine)
//! 3. Environment variables prefixed with `WEARSYNC_`, sections separated by
//!    a double underscore
//!
//! # Example
//! ```no_run
//! use wearsync::config::WearSyncConfig;
//!
//! // WEARSYNC_INGEST__API_KEY=secret overrides [ingest] api_key
//! let config = WearSyncConfig::load()?;
//! println!("Syncing to {}", config.ingest.base_url);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::error_recovery::RetryPolicy;
use crate::store::StoreOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/wearsync.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WearSyncConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Partition tags stamped on every sample
    pub identity: IdentityConfig,
    /// Sample journal settings
    pub storage: StorageConfig,
    /// Remote ingest endpoint
    pub ingest: IngestConfig,
    /// Sync batching and timing
    pub sync: SyncConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

/// Deployment-constant partition tags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Wearer id sent as `uid`
    pub user_id: String,
    /// Team id sent as `team`
    pub team_id: String,
}

/// Sample journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Journal file path
    pub path: PathBuf,
    /// Superseded records tolerated before the journal is rewritten
    pub compact_after: usize,
    /// fsync every journal record
    pub fsync: bool,
}

/// Remote ingest endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Base URL, `/ingest` is appended
    pub base_url: String,
    /// Key sent as the `api_key` query parameter
    pub api_key: String,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

/// Sync scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Samples per request
    pub batch_size: usize,
    /// Seconds between periodic syncs
    pub interval_secs: u64,
    /// First retry delay after a failed sync, in milliseconds
    pub retry_initial_ms: u64,
    /// Longest retry delay, in milliseconds
    pub retry_max_ms: u64,
    /// Ingest queue capacity in packets
    pub queue_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "wearsync".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            user_id: "user_01".to_string(),
            team_id: "default".to_string(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/samples.journal"),
            compact_after: 1000,
            fsync: true,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            base_url: "http://10.0.2.2:8000".to_string(),
            api_key: "dev-secret-key".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::sync::DEFAULT_BATCH_SIZE,
            interval_secs: 15 * 60,
            retry_initial_ms: 30_000,
            retry_max_ms: 300_000,
            queue_capacity: 256,
        }
    }
}

impl WearSyncConfig {
    /// Load configuration from the default path and environment variables
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(WearSyncConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("WEARSYNC_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.identity.user_id.trim().is_empty() || self.identity.team_id.trim().is_empty() {
            return Err("identity.user_id and identity.team_id must not be empty".to_string());
        }

        if !self.ingest.base_url.starts_with("http://") {
            return Err(format!(
                "Invalid ingest base_url '{}'. Must start with http://",
                self.ingest.base_url
            ));
        }

        if self.ingest.timeout_ms == 0 {
            return Err("ingest.timeout_ms must be greater than 0".to_string());
        }

        if self.sync.batch_size == 0 {
            return Err("sync.batch_size must be greater than 0".to_string());
        }

        if self.sync.queue_capacity == 0 {
            return Err("sync.queue_capacity must be greater than 0".to_string());
        }

        if self.sync.retry_initial_ms > self.sync.retry_max_ms {
            return Err(format!(
                "sync.retry_initial_ms ({}) exceeds sync.retry_max_ms ({})",
                self.sync.retry_initial_ms, self.sync.retry_max_ms
            ));
        }

        Ok(())
    }

    /// Journal options derived from `[storage]`
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            compact_after: self.storage.compact_after,
            fsync: self.storage.fsync,
        }
    }

    /// Backoff policy derived from `[sync]`
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.sync.retry_initial_ms),
            Duration::from_millis(self.sync.retry_max_ms),
        )
    }

    /// Periodic sync interval
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_secs)
    }

    /// Per-request ingest timeout
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_millis(self.ingest.timeout_ms)
    }
}
