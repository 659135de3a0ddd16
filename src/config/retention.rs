//! Retention cleanup configuration.
//!
//! Each retention class maps to a window in days. A record of that class is
//! eligible for deletion once it is older than its window.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! timeout_secs = 600
//! batch_size = 1000
//! blob_concurrency = 16
//! dry_run = false
//!
//! [retention.windows]
//! exposure = 14
//! export = 30
//!
//! [retention.schedule]
//! enabled = false
//! interval_secs = 3600
//! ```

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::retention::RetentionPolicy;

/// Cleanup policy and run limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Retention window in days, keyed by retention class.
    ///
    /// Windows must be positive. Classes are processed in lexicographic order.
    #[serde(default)]
    pub windows: BTreeMap<String, i64>,

    /// Time budget for a single run, in seconds.
    /// Default: 600 (10 minutes)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum records fetched and purged per batch.
    /// Default: 1000
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Maximum concurrent blob deletes within a batch.
    /// Default: 16
    #[serde(default = "default_blob_concurrency")]
    pub blob_concurrency: usize,

    /// If true, count what would be deleted without deleting anything.
    /// Default: false
    #[serde(default)]
    pub dry_run: bool,

    /// In-process schedule. Off by default; an external scheduler normally
    /// calls the trigger endpoint.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            windows: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            batch_size: default_batch_size(),
            blob_concurrency: default_blob_concurrency(),
            dry_run: false,
            schedule: ScheduleConfig::default(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_batch_size() -> u32 {
    1000
}

fn default_blob_concurrency() -> usize {
    16
}

impl RetentionConfig {
    /// Get the run timeout as a Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "retention.timeout_secs must be greater than 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Validation(
                "retention.batch_size must be greater than 0".into(),
            ));
        }
        if self.blob_concurrency == 0 {
            return Err(ConfigError::Validation(
                "retention.blob_concurrency must be greater than 0".into(),
            ));
        }
        if self.schedule.enabled && self.schedule.interval_secs == 0 {
            return Err(ConfigError::Validation(
                "retention.schedule.interval_secs must be greater than 0".into(),
            ));
        }

        RetentionPolicy::from_days(&self.windows)
            .map(|_| ())
            .map_err(|e| ConfigError::Validation(e.to_string()))
    }
}

/// In-process cleanup schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Whether the service runs cleanup on its own timer.
    /// Default: false
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between the end of one run and the start of the next.
    /// Default: 3600 (1 hour)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_interval_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    3600
}

impl ScheduleConfig {
    /// Get the interval as a Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
