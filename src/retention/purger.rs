use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use super::CleanupError;
use crate::{
    models::BlobReference,
    services::{BlobDeletion, BlobStore},
};

/// Deletes database rows for records whose blobs are gone.
#[async_trait]
pub trait RecordPurger: Send + Sync {
    /// Delete the records and their child rows in one transaction.
    ///
    /// Missing ids are skipped. Returns how many records were removed.
    async fn delete_records(&self, ids: &[Uuid]) -> Result<u64, CleanupError>;
}

/// Per-batch result of [`BlobPurger::delete_blobs`].
#[derive(Debug, Default)]
pub struct BlobPurgeReport {
    pub deleted: u64,
    /// Already gone; counts as success.
    pub not_found: u64,
    pub failed: Vec<BlobReference>,
}

impl BlobPurgeReport {
    pub fn attempted(&self) -> usize {
        self.deleted as usize + self.not_found as usize + self.failed.len()
    }
}

/// Deletes blobs with bounded concurrency.
pub struct BlobPurger {
    store: Arc<dyn BlobStore>,
    concurrency: usize,
}

impl BlobPurger {
    pub fn new(store: Arc<dyn BlobStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Delete every reference, collecting failures instead of stopping.
    ///
    /// Returns [`CleanupError::StorageUnavailable`] only when every delete
    /// failed and at least one failure was a connectivity error.
    pub async fn delete_blobs(
        &self,
        refs: &[BlobReference],
    ) -> Result<BlobPurgeReport, CleanupError> {
        let results: Vec<_> = stream::iter(refs.iter().cloned())
            .map(|blob| {
                let store = self.store.clone();
                async move {
                    let result = store.delete(&blob).await;
                    (blob, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = BlobPurgeReport::default();
        let mut unreachable = None;
        for (blob, result) in results {
            match result {
                Ok(BlobDeletion::Deleted) => report.deleted += 1,
                Ok(BlobDeletion::NotFound) => report.not_found += 1,
                Err(e) => {
                    tracing::warn!(blob = %blob, error = %e, "Failed to delete blob");
                    if e.is_unavailable() && unreachable.is_none() {
                        unreachable = Some(e.to_string());
                    }
                    report.failed.push(blob);
                }
            }
        }

        if !refs.is_empty()
            && report.failed.len() == refs.len()
            && let Some(reason) = unreachable
        {
            return Err(CleanupError::StorageUnavailable(format!(
                "blob store {}: {}",
                self.store.backend_name(),
                reason
            )));
        }

        Ok(report)
    }
}
