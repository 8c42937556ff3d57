//! Runtime configuration for the state machine
//!
//! Values come from defaults, then an optional TOML file, then environment
//! variables. Binaries apply command-line overrides on top.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Default number of log entries between snapshots
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateMachineConfig {
    /// Directory holding one subdirectory per database
    pub data_root: PathBuf,
    /// Log entries appended between snapshots; 0 disables compaction
    pub snapshot_threshold: u64,
    /// Start replicas as non-leaders: they apply commits but never publish
    pub standby: bool,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./node-data"),
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            standby: false,
        }
    }
}

impl StateMachineConfig {
    /// Defaults overridden by `NODE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Read a TOML file, then apply environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(root) = std::env::var("NODE_DATA_ROOT") {
            self.data_root = PathBuf::from(root);
        }
        if let Ok(threshold) = std::env::var("NODE_SNAPSHOT_THRESHOLD") {
            if let Ok(n) = threshold.parse() {
                self.snapshot_threshold = n;
            }
        }
        if let Ok(val) = std::env::var("NODE_STANDBY") {
            self.standby = val.to_lowercase() == "true" || val == "1";
        }
    }

    pub fn with_data_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.data_root = root.into();
        self
    }
}
