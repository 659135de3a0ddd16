//! Keyset cursor over `(created_at, id)`.
//!
//! The stale-record locator walks records oldest first. Carrying the position
//! of the last record seen, rather than an offset, keeps a run from returning
//! the same record twice even when earlier records are deleted between batches
//! or retained after a blob failure.
//!
//! # Timestamp Precision
//!
//! SQLite stores DateTime as TEXT and compares it lexically. Timestamps written
//! with mixed sub-second precision do not order correctly, so every timestamp
//! that reaches a query (stored values, cutoffs, cursors) is truncated to
//! milliseconds first:
//!
//! ```rust,ignore
//! use crate::db::repos::truncate_to_millis;
//!
//! let created_at = truncate_to_millis(Utc::now());
//! ```

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::ExposureRecord;

/// A position in the `(created_at, id)` ordering.
///
/// The `id` component breaks ties between records with the same timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    /// The timestamp component of the cursor position.
    pub created_at: DateTime<Utc>,
    /// The UUID component of the cursor position.
    pub id: Uuid,
}

impl Cursor {
    /// Create a new cursor from a timestamp and ID.
    pub fn new(created_at: DateTime<Utc>, id: Uuid) -> Self {
        Self { created_at, id }
    }

    /// Cursor positioned at a record.
    pub fn after(record: &ExposureRecord) -> Self {
        Self::new(record.created_at, record.id)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.created_at.timestamp_millis(), self.id)
    }
}

/// Truncate a DateTime to millisecond precision.
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}
