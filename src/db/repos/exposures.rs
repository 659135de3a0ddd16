use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Cursor;
use crate::{
    db::error::DbResult,
    models::{CreateExposure, ExposureRecord, StaleBatch},
};

#[async_trait]
pub trait ExposureRepo: Send + Sync {
    /// Insert an exposure record together with its blob references
    async fn create(&self, input: CreateExposure) -> DbResult<ExposureRecord>;

    /// Get an exposure record (with blobs) by ID
    async fn get_by_id(&self, id: Uuid) -> DbResult<Option<ExposureRecord>>;

    /// Count every record of a retention class, stale or not
    async fn count_by_class(&self, retention_class: &str) -> DbResult<u64>;

    /// Count blob references still attached to any record
    async fn count_blobs(&self) -> DbResult<u64>;

    // ==================== Retention Operations ====================

    /// Fetch the next page of records of `retention_class` created strictly
    /// before `cutoff`, ordered by `(created_at, id)` ascending.
    ///
    /// When `after` is set, only records positioned after that cursor are
    /// returned. Each record carries its blob references.
    async fn next_stale_batch(
        &self,
        retention_class: &str,
        cutoff: DateTime<Utc>,
        after: Option<&Cursor>,
        limit: u32,
    ) -> DbResult<StaleBatch>;

    /// Delete records and their blob reference rows in one transaction.
    ///
    /// IDs that no longer exist are skipped. Returns the number of records
    /// removed.
    async fn delete_records(&self, ids: &[Uuid]) -> DbResult<u64>;
}
