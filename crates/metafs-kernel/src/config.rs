//! Mount configuration.
//!
//! Configuration comes either from a TOML file or from the comma-separated
//! option string passed on the mount command line:
//!
//! ```toml
//! strict_quota = true
//!
//! [mapper]
//! use_raw_file_access = true
//! allow_write = false
//!
//! [quota]
//! max_space = 1048576
//! max_nodes = 1000
//!
//! [scan]
//! poll_interval_ms = 30000
//! busy_timeout_ms = 10000
//! watch = true
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::stats::{Quota, UsageStats};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown mount option: {0}")]
    UnknownOption(String),

    #[error("invalid value for mount option {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Access settings for path-mapped filesystems.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Serve reads and writes straight from the backing files.
    pub use_raw_file_access: bool,
    /// Permit writes to backing files.
    pub allow_write: bool,
}

/// Background rescan settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Rescan periodically in addition to change notifications.
    pub poll_interval_ms: Option<u64>,
    /// How long a scan waits on a locked database.
    pub busy_timeout_ms: u64,
    /// Watch the source for changes.
    pub watch: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: None,
            busy_timeout_ms: 10_000,
            watch: true,
        }
    }
}

impl ScanConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Complete configuration for one mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    pub mapper: MapperConfig,
    pub quota: Quota,
    /// Reject writes that would exceed the quota instead of only reporting.
    pub strict_quota: bool,
    pub scan: ScanConfig,
}

impl MountConfig {
    /// Root accounting node carrying the configured quota and strictness.
    pub fn usage_stats(&self) -> Arc<UsageStats> {
        UsageStats::with_quota(self.quota, self.strict_quota)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse a mount option string such as
    /// `use_raw_file_access,allow_write,max_space=1024,poll=500`.
    ///
    /// Empty items are ignored; unknown keys are an error.
    pub fn from_mount_options(options: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for item in options.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (item, None),
            };
            match (key, value) {
                ("use_raw_file_access", None) => config.mapper.use_raw_file_access = true,
                ("allow_write", None) => config.mapper.allow_write = true,
                ("strict_quota", None) => config.strict_quota = true,
                ("nowatch", None) => config.scan.watch = false,
                ("max_space", Some(v)) => config.quota.max_space = Some(number(key, v)?),
                ("max_nodes", Some(v)) => config.quota.max_nodes = Some(number(key, v)?),
                ("poll", Some(v)) => config.scan.poll_interval_ms = Some(number(key, v)?),
                ("busy_timeout", Some(v)) => config.scan.busy_timeout_ms = number(key, v)?,
                _ => return Err(ConfigError::UnknownOption(item.to_string())),
            }
        }
        Ok(config)
    }
}

fn number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
