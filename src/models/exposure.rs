use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle to an object in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobReference {
    /// Bucket (S3) or sub-directory (filesystem) holding the object
    pub bucket: String,
    /// Object name within the bucket
    pub object_name: String,
}

impl BlobReference {
    pub fn new(bucket: impl Into<String>, object_name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object_name: object_name.into(),
        }
    }
}

impl std::fmt::Display for BlobReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.object_name)
    }
}

/// An exposure-tracing record subject to retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExposureRecord {
    /// Unique identifier
    pub id: Uuid,
    /// When the record was created; retention is measured from here
    pub created_at: DateTime<Utc>,
    /// Retention class, selecting which window applies
    pub retention_class: String,
    /// Blobs owned by this record (may be empty)
    pub blobs: Vec<BlobReference>,
}

/// Input for inserting an exposure record.
///
/// Ingestion is owned by another service; this exists for migrations tooling
/// and tests.
#[derive(Debug, Clone)]
pub struct CreateExposure {
    /// Explicit ID, or a fresh v4 when `None`
    pub id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub retention_class: String,
    pub blobs: Vec<BlobReference>,
}

impl CreateExposure {
    pub fn new(retention_class: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            created_at,
            retention_class: retention_class.into(),
            blobs: Vec::new(),
        }
    }

    pub fn with_blob(mut self, bucket: impl Into<String>, object_name: impl Into<String>) -> Self {
        self.blobs.push(BlobReference::new(bucket, object_name));
        self
    }
}

/// One page of stale records returned by the locator.
#[derive(Debug, Clone, Default)]
pub struct StaleBatch {
    /// Records ordered by `(created_at, id)` ascending
    pub records: Vec<ExposureRecord>,
    /// Whether more stale records exist past the last one returned
    pub has_more: bool,
}
