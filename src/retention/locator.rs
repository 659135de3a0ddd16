use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CleanupError, RecordPurger};
use crate::{
    db::{Cursor, DbError, ExposureRepo},
    models::StaleBatch,
};

/// Finds records eligible for deletion.
#[async_trait]
pub trait RecordLocator: Send + Sync {
    /// Number of records of a class, stale or not.
    async fn count_class(&self, retention_class: &str) -> Result<u64, CleanupError>;

    /// Next page of records created strictly before `cutoff`, oldest first,
    /// positioned after `after` when given.
    async fn next_batch(
        &self,
        retention_class: &str,
        cutoff: DateTime<Utc>,
        after: Option<&Cursor>,
        max_batch_size: u32,
    ) -> Result<StaleBatch, CleanupError>;
}

/// Locator and record purger backed by the exposure repository.
#[derive(Clone)]
pub struct RepoRecordStore {
    repo: Arc<dyn ExposureRepo>,
}

impl RepoRecordStore {
    pub fn new(repo: Arc<dyn ExposureRepo>) -> Self {
        Self { repo }
    }
}

/// Any database failure mid-run means the store cannot be trusted for the rest
/// of the run. The message says whether the database was unreachable or
/// answered with an error.
fn unavailable(op: &str, err: DbError) -> CleanupError {
    if err.is_unavailable() {
        CleanupError::StorageUnavailable(format!("database unreachable during {}: {}", op, err))
    } else {
        tracing::warn!(error = %err, operation = op, "Database error during cleanup");
        CleanupError::StorageUnavailable(format!("database {} failed: {}", op, err))
    }
}

#[async_trait]
impl RecordLocator for RepoRecordStore {
    async fn count_class(&self, retention_class: &str) -> Result<u64, CleanupError> {
        self.repo
            .count_by_class(retention_class)
            .await
            .map_err(|e| unavailable("count", e))
    }

    async fn next_batch(
        &self,
        retention_class: &str,
        cutoff: DateTime<Utc>,
        after: Option<&Cursor>,
        max_batch_size: u32,
    ) -> Result<StaleBatch, CleanupError> {
        self.repo
            .next_stale_batch(retention_class, cutoff, after, max_batch_size)
            .await
            .map_err(|e| unavailable("locate", e))
    }
}

#[async_trait]
impl RecordPurger for RepoRecordStore {
    async fn delete_records(&self, ids: &[Uuid]) -> Result<u64, CleanupError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.repo
            .delete_records(ids)
            .await
            .map_err(|e| unavailable("delete", e))
    }
}
