use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

use super::CleanupError;
use crate::db::truncate_to_millis;

/// Retention windows keyed by retention class.
///
/// A record is stale when `now - created_at > window`, i.e. when it was
/// created strictly before [`RetentionPolicy::cutoff_for`].
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    windows: BTreeMap<String, Duration>,
}

impl RetentionPolicy {
    /// Build a policy from windows expressed in days.
    ///
    /// Fails when no window is configured or when any window is zero or
    /// negative.
    pub fn from_days(windows: &BTreeMap<String, i64>) -> Result<Self, CleanupError> {
        if windows.is_empty() {
            return Err(CleanupError::Configuration(
                "at least one retention window must be configured in [retention.windows]".into(),
            ));
        }

        let mut parsed = BTreeMap::new();
        for (class, days) in windows {
            if class.trim().is_empty() {
                return Err(CleanupError::Configuration(
                    "retention class names must not be empty".into(),
                ));
            }
            if *days <= 0 {
                return Err(CleanupError::Configuration(format!(
                    "retention window for class '{}' must be positive, got {} days",
                    class, days
                )));
            }
            let window = Duration::try_days(*days).ok_or_else(|| {
                CleanupError::Configuration(format!(
                    "retention window for class '{}' is out of range: {} days",
                    class, days
                ))
            })?;
            parsed.insert(class.clone(), window);
        }

        Ok(Self { windows: parsed })
    }

    /// Configured classes, in lexicographic order.
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// Window for a class, if configured.
    pub fn window_for(&self, retention_class: &str) -> Option<Duration> {
        self.windows.get(retention_class).copied()
    }

    /// Oldest creation time a record of `retention_class` may have and still
    /// be retained. `None` for classes without a window; such records are
    /// never deleted.
    pub fn cutoff_for(&self, retention_class: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let window = self.window_for(retention_class)?;
        now.checked_sub_signed(window).map(truncate_to_millis)
    }
}
