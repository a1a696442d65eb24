//! Configuration management for MetaFS volumes
//!
//! This module provides a centralized configuration system that supports:
//! - YAML configuration files
//! - Environment variable overrides
//! - Reasonable defaults
//! - Configuration validation

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Replay-log records and checkpoint buffers are padded to this boundary.
pub const LOG_ALIGNMENT: u64 = 4096;

/// Per-volume configuration for the checkpoint and replay-log engine.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VolumeConfig {
    /// Object-store account the volume lives under.
    pub account_name: String,

    /// Container holding checkpoint objects and the checkpoint header.
    pub checkpoint_container: String,

    /// Storage policy applied when the checkpoint container is created.
    pub storage_policy: String,

    /// Local replay-log file path. `None` disables the replay log; the
    /// engine still functions but tolerates data loss between checkpoints.
    #[serde(default)]
    pub replay_log_path: Option<PathBuf>,

    /// Seconds between timer-driven checkpoints.
    pub checkpoint_interval_secs: u64,

    /// Chunked-PUT contexts are closed once this many bytes were shipped,
    /// bounding single-object size and recovery cost.
    pub max_flush_size: u64,

    /// How many nonce values each header POST reserves durably.
    pub nonce_values_to_reserve: u64,

    /// Seed reservation written into the header when a volume is formatted.
    pub first_nonce: u64,

    /// Maximum entries per B+Tree leaf before it splits.
    pub leaf_fanout: usize,

    /// Clean leaf nodes kept in memory per tree before LRU eviction.
    pub leaf_cache_capacity: usize,

    /// When true, a fatal replay-log or checkpoint error aborts the
    /// process. When false the volume is poisoned instead: every
    /// subsequent operation fails, but the process survives so a
    /// supervisor can react.
    pub halt_on_fatal_error: bool,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            account_name: "metafs".to_string(),
            checkpoint_container: "checkpoints".to_string(),
            storage_policy: "standard".to_string(),
            replay_log_path: None,
            checkpoint_interval_secs: 600,
            max_flush_size: 10_000_000,
            nonce_values_to_reserve: 10_000,
            first_nonce: 100,
            leaf_fanout: 128,
            leaf_cache_capacity: 1024,
            halt_on_fatal_error: true,
        }
    }
}

impl VolumeConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables (highest priority)
    /// 2. Config file specified by METAFS_CONFIG env var
    /// 3. ./config/metafs.yaml
    /// 4. /etc/metafs/metafs.yaml
    /// 5. Hardcoded defaults (lowest priority)
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        builder = Self::set_defaults(builder)?;

        if let Ok(config_path) = std::env::var("METAFS_CONFIG") {
            builder = builder.add_source(File::with_name(&config_path).required(false));
        }

        builder = builder
            .add_source(File::with_name("./config/metafs").required(false))
            .add_source(File::with_name("/etc/metafs/metafs").required(false));

        // Override with environment variables
        // Example: METAFS_CHECKPOINT_INTERVAL_SECS=60
        builder = builder.add_source(
            Environment::with_prefix("METAFS")
                .separator("__")
                .try_parsing(true),
        );

        let config: VolumeConfig = builder.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Set default values for all configuration options
    fn set_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = Self::default();
        builder
            .set_default("account_name", defaults.account_name)?
            .set_default("checkpoint_container", defaults.checkpoint_container)?
            .set_default("storage_policy", defaults.storage_policy)?
            .set_default(
                "checkpoint_interval_secs",
                defaults.checkpoint_interval_secs,
            )?
            .set_default("max_flush_size", defaults.max_flush_size)?
            .set_default("nonce_values_to_reserve", defaults.nonce_values_to_reserve)?
            .set_default("first_nonce", defaults.first_nonce)?
            .set_default("leaf_fanout", defaults.leaf_fanout as u64)?
            .set_default("leaf_cache_capacity", defaults.leaf_cache_capacity as u64)?
            .set_default("halt_on_fatal_error", defaults.halt_on_fatal_error)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.account_name.is_empty() {
            return Err(ConfigError::Message(
                "account_name must not be empty".to_string(),
            ));
        }

        if self.checkpoint_container.is_empty() {
            return Err(ConfigError::Message(
                "checkpoint_container must not be empty".to_string(),
            ));
        }

        if self.nonce_values_to_reserve == 0 {
            return Err(ConfigError::Message(
                "nonce_values_to_reserve must be > 0".to_string(),
            ));
        }

        // Nonce 0 is the "no checkpoint object" sentinel and must never
        // be handed out.
        if self.first_nonce == 0 {
            return Err(ConfigError::Message(
                "first_nonce must be > 0".to_string(),
            ));
        }

        if self.max_flush_size < LOG_ALIGNMENT {
            return Err(ConfigError::Message(format!(
                "max_flush_size must be >= {}",
                LOG_ALIGNMENT
            )));
        }

        if self.leaf_fanout == 0 {
            return Err(ConfigError::Message(
                "leaf_fanout must be > 0".to_string(),
            ));
        }

        if self.leaf_cache_capacity == 0 {
            return Err(ConfigError::Message(
                "leaf_cache_capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Load configuration from a specific file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: VolumeConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .build()?
            .try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// Convert the checkpoint interval to a Duration
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}
