//! Configuration schema for Kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use crate::maintenance::MaintenancePolicy;
use crate::store::LockOptions;
use crate::util::compact_duration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache location and retention
    pub cache: CacheConfig,

    /// Lock waiting behavior
    pub lock: LockConfig,
}

impl Config {
    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            timeout: self.lock.timeout,
            print_info_after: self.lock.print_info_after,
            poll_interval: Duration::from_millis(self.lock.poll_interval_ms.max(1)),
        }
    }

    pub fn maintenance_policy(&self) -> MaintenancePolicy {
        MaintenancePolicy {
            expire_unused_after: self.cache.expire_unused_after,
            perform_cleanup_after: self.cache.perform_cleanup_after,
            delay_cleanup_by: self.cache.delay_cleanup_by,
        }
    }
}

/// General application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root (default: `<cache_dir>/kiln`)
    pub root: Option<PathBuf>,

    /// Entries unused for longer than this are eviction candidates
    #[serde(with = "compact_duration")]
    pub expire_unused_after: Duration,

    /// Minimum interval between cleanups
    #[serde(with = "compact_duration")]
    pub perform_cleanup_after: Duration,

    /// Grace period between scheduling a cleanup and running it
    #[serde(with = "compact_duration")]
    pub delay_cleanup_by: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let policy = MaintenancePolicy::default();
        Self {
            root: None,
            expire_unused_after: policy.expire_unused_after,
            perform_cleanup_after: policy.perform_cleanup_after,
            delay_cleanup_by: policy.delay_cleanup_by,
        }
    }
}

/// Lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Give up waiting for a lock after this long
    #[serde(with = "compact_duration")]
    pub timeout: Duration,

    /// Log a "still waiting" line this often
    #[serde(with = "compact_duration")]
    pub print_info_after: Duration,

    /// Polling interval for another process's lock file, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        let options = LockOptions::default();
        Self {
            timeout: options.timeout,
            print_info_after: options.print_info_after,
            poll_interval_ms: options.poll_interval.as_millis() as u64,
        }
    }
}
