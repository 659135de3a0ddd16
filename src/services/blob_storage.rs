//! Pluggable blob storage backends holding exposure artifacts.
//!
//! Every blob is addressed by a [`BlobReference`] of `(bucket, object_name)`:
//!
//! - **Filesystem**: `{root}/{bucket}/{object_name}` on the local filesystem
//! - **S3**: object `{key_prefix}{object_name}` in S3 bucket `bucket`
//!
//! Cleanup only ever deletes, so the trait exposes delete and existence
//! checks. A delete of an object that is already gone reports
//! [`BlobDeletion::NotFound`] rather than an error.

use std::path::{Component, Path, PathBuf};
#[cfg(test)]
use std::{
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
#[cfg(feature = "s3-storage")]
use tracing::error;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "s3-storage")]
use crate::config::S3StorageConfig;
use crate::{
    config::{FilesystemStorageConfig, StorageBackend, StorageConfig},
    models::BlobReference,
};

/// Errors that can occur during blob storage operations.
#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("S3 error: {0}")]
    S3(String),

    #[error("Blob store unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid blob reference {0}")]
    InvalidReference(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BlobStoreError {
    /// Whether the error means the store could not be reached at all.
    pub fn is_unavailable(&self) -> bool {
        match self {
            BlobStoreError::Unavailable(_) => true,
            BlobStoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type BlobStoreResult<T> = Result<T, BlobStoreError>;

/// Result of a successful delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobDeletion {
    /// The object existed and was removed.
    Deleted,
    /// The object was already gone.
    NotFound,
}

/// Trait for pluggable blob storage backends.
///
/// Implementations must be `Send + Sync` to support async contexts.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Delete a blob. Deleting a missing blob succeeds with
    /// [`BlobDeletion::NotFound`].
    async fn delete(&self, blob: &BlobReference) -> BlobStoreResult<BlobDeletion>;

    /// Check if a blob exists.
    async fn exists(&self, blob: &BlobReference) -> BlobStoreResult<bool>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> BlobStoreResult<()>;

    /// Get the backend type name (for logging/debugging).
    fn backend_name(&self) -> &'static str;
}

/// Filesystem blob storage backend.
///
/// Blobs are stored as `{root}/{bucket}/{object_name}`.
pub struct FilesystemBlobStore {
    config: FilesystemStorageConfig,
}

impl FilesystemBlobStore {
    pub fn new(config: FilesystemStorageConfig) -> Self {
        Self { config }
    }

    fn root(&self) -> &Path {
        Path::new(&self.config.path)
    }

    /// Resolve a reference to a path under the root, rejecting anything that
    /// would escape it.
    fn blob_path(&self, blob: &BlobReference) -> BlobStoreResult<PathBuf> {
        let relative = Path::new(&blob.bucket).join(&blob.object_name);
        let escapes = blob.bucket.is_empty()
            || blob.object_name.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(BlobStoreError::InvalidReference(blob.to_string()));
        }
        Ok(self.root().join(relative))
    }

    /// A missing root means the volume is not mounted, not that every blob is gone.
    async fn ensure_root(&self) -> BlobStoreResult<()> {
        match tokio::fs::metadata(self.root()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BlobStoreError::Unavailable(format!(
                "{} is not a directory",
                self.config.path
            ))),
            Err(e) => Err(BlobStoreError::Unavailable(format!(
                "{}: {}",
                self.config.path, e
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    #[instrument(skip(self), fields(blob = %blob))]
    async fn delete(&self, blob: &BlobReference) -> BlobStoreResult<BlobDeletion> {
        let path = self.blob_path(blob)?;
        self.ensure_root().await?;

        debug!(path = %path.display(), "Deleting blob from filesystem");

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(BlobDeletion::Deleted),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Blob not found during deletion");
                Ok(BlobDeletion::NotFound)
            }
            Err(e) => Err(BlobStoreError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(blob = %blob))]
    async fn exists(&self, blob: &BlobReference) -> BlobStoreResult<bool> {
        let path = self.blob_path(blob)?;
        self.ensure_root().await?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn health_check(&self) -> BlobStoreResult<()> {
        self.ensure_root().await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// S3-compatible object storage backend.
///
/// Works with AWS S3, MinIO, Cloudflare R2 and GCS in interoperability mode.
///
/// Requires the `s3-storage` feature.
#[cfg(feature = "s3-storage")]
pub struct S3BlobStore {
    config: S3StorageConfig,
    client: aws_sdk_s3::Client,
}

#[cfg(feature = "s3-storage")]
impl S3BlobStore {
    pub async fn new(config: S3StorageConfig) -> BlobStoreResult<Self> {
        info!(
            region = ?config.region,
            endpoint = ?config.endpoint,
            "Initializing S3 blob storage"
        );

        let mut sdk_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest());

        // Set region if specified
        if let Some(region) = &config.region {
            sdk_config_builder = sdk_config_builder.region(aws_config::Region::new(region.clone()));
        }

        // Set credentials if specified in config
        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = aws_credential_types::Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None, // session token
                None, // expiry
                "exposure-cleanup-config",
            );
            sdk_config_builder = sdk_config_builder.credentials_provider(credentials);
        }

        let sdk_config = sdk_config_builder.load().await;

        // Build S3 client with custom endpoint if specified
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = aws_sdk_s3::Client::from_conf(s3_config_builder.build());

        Ok(Self { config, client })
    }

    fn is_not_found(err: &str) -> bool {
        err.contains("NoSuchKey") || err.contains("NotFound")
    }

    /// Map an SDK error, classifying transport failures as unavailability.
    fn map_sdk_error<E, R>(err: aws_sdk_s3::error::SdkError<E, R>) -> BlobStoreError
    where
        E: std::error::Error + Send + Sync + 'static,
        R: std::fmt::Debug,
    {
        use aws_sdk_s3::error::SdkError;

        match &err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
                BlobStoreError::Unavailable(err.to_string())
            }
            _ => BlobStoreError::S3(aws_sdk_s3::error::DisplayErrorContext(&err).to_string()),
        }
    }
}

#[cfg(feature = "s3-storage")]
#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %blob.bucket))]
    async fn delete(&self, blob: &BlobReference) -> BlobStoreResult<BlobDeletion> {
        let key = self.config.object_key(&blob.object_name);
        debug!(key, "Deleting blob from S3");

        // DeleteObject succeeds for missing keys on AWS; GCS and some
        // S3-compatible services answer NoSuchKey instead.
        match self
            .client
            .delete_object()
            .bucket(&blob.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(BlobDeletion::Deleted),
            Err(e) => {
                let mapped = Self::map_sdk_error(e);
                if let BlobStoreError::S3(msg) = &mapped
                    && Self::is_not_found(msg)
                {
                    warn!(key, "Blob not found during deletion");
                    return Ok(BlobDeletion::NotFound);
                }
                error!(error = %mapped, key, "Failed to delete from S3");
                Err(mapped)
            }
        }
    }

    #[instrument(skip(self), fields(bucket = %blob.bucket))]
    async fn exists(&self, blob: &BlobReference) -> BlobStoreResult<bool> {
        let key = self.config.object_key(&blob.object_name);

        match self
            .client
            .head_object()
            .bucket(&blob.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => match Self::map_sdk_error(e) {
                BlobStoreError::S3(msg) if Self::is_not_found(&msg) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn health_check(&self) -> BlobStoreResult<()> {
        self.client
            .list_buckets()
            .max_buckets(1)
            .send()
            .await
            .map(|_| ())
            .map_err(Self::map_sdk_error)
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

/// In-memory blob store with fault injection.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: dashmap::DashSet<BlobReference>,
    failing: dashmap::DashSet<BlobReference>,
    unavailable: AtomicBool,
    delete_latency: std::sync::Mutex<Option<Duration>>,
    delete_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

#[cfg(test)]
impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, blob: BlobReference) {
        self.objects.insert(blob);
    }

    pub fn contains(&self, blob: &BlobReference) -> bool {
        self.objects.contains(blob)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Make deletes of `blob` fail until [`MemoryBlobStore::heal`] is called.
    pub fn fail_on(&self, blob: BlobReference) {
        self.failing.insert(blob);
    }

    /// Clear every injected fault.
    pub fn heal(&self) {
        self.failing.clear();
        self.unavailable.store(false, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_delete_latency(&self, latency: Duration) {
        if let Ok(mut guard) = self.delete_latency.lock() {
            *guard = Some(latency);
        }
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn delete(&self, blob: &BlobReference) -> BlobStoreResult<BlobDeletion> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.delete_latency.lock().ok().and_then(|g| *g);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result = if self.unavailable.load(Ordering::SeqCst) {
            Err(BlobStoreError::Unavailable("memory store offline".into()))
        } else if self.failing.contains(blob) {
            Err(BlobStoreError::S3(format!("injected failure for {blob}")))
        } else if self.objects.remove(blob).is_some() {
            Ok(BlobDeletion::Deleted)
        } else {
            Ok(BlobDeletion::NotFound)
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn exists(&self, blob: &BlobReference) -> BlobStoreResult<bool> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Unavailable("memory store offline".into()));
        }
        Ok(self.objects.contains(blob))
    }

    async fn health_check(&self) -> BlobStoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BlobStoreError::Unavailable("memory store offline".into()));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Create a blob storage backend from configuration.
pub async fn create_blob_store(
    config: &StorageConfig,
) -> BlobStoreResult<std::sync::Arc<dyn BlobStore>> {
    match config.backend {
        StorageBackend::Filesystem => {
            info!(path = %config.filesystem.path, "Using filesystem blob storage backend");
            Ok(std::sync::Arc::new(FilesystemBlobStore::new(
                config.filesystem.clone(),
            )))
        }
        #[cfg(feature = "s3-storage")]
        StorageBackend::S3 => {
            let s3_config = config.s3.clone().ok_or_else(|| {
                BlobStoreError::Config("S3 backend requires [storage.s3] config".to_string())
            })?;
            info!("Using S3 blob storage backend");
            Ok(std::sync::Arc::new(S3BlobStore::new(s3_config).await?))
        }
        #[cfg(not(feature = "s3-storage"))]
        StorageBackend::S3 => Err(BlobStoreError::Config(
            "S3 blob storage backend requires the 's3-storage' feature. \
                Rebuild with: cargo build --features s3-storage"
                .to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn fs_store(dir: &TempDir) -> FilesystemBlobStore {
        FilesystemBlobStore::new(FilesystemStorageConfig {
            path: dir.path().to_string_lossy().to_string(),
        })
    }

    async fn write_blob(dir: &TempDir, blob: &BlobReference) {
        let path = dir.path().join(&blob.bucket).join(&blob.object_name);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"exposure keys").await.unwrap();
    }

    #[test]
    fn test_filesystem_blob_path() {
        let store = FilesystemBlobStore::new(FilesystemStorageConfig {
            path: "/var/lib/blobs".to_string(),
        });
        let path = store
            .blob_path(&BlobReference::new("exports", "2024/01/batch.zip"))
            .unwrap();
        assert_eq!(path, PathBuf::from("/var/lib/blobs/exports/2024/01/batch.zip"));
    }

    #[test]
    fn test_filesystem_rejects_escaping_references() {
        let store = FilesystemBlobStore::new(FilesystemStorageConfig {
            path: "/var/lib/blobs".to_string(),
        });
        for blob in [
            BlobReference::new("exports", "../../etc/passwd"),
            BlobReference::new("..", "x"),
            BlobReference::new("exports", "/abs/path"),
            BlobReference::new("", "x"),
            BlobReference::new("exports", ""),
        ] {
            assert!(matches!(
                store.blob_path(&blob),
                Err(BlobStoreError::InvalidReference(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_filesystem_delete_and_exists() {
        let dir = TempDir::new().unwrap();
        let store = fs_store(&dir);
        let blob = BlobReference::new("exports", "2024/batch-1.zip");
        write_blob(&dir, &blob).await;

        assert!(store.exists(&blob).await.unwrap());
        assert_eq!(store.delete(&blob).await.unwrap(), BlobDeletion::Deleted);
        assert!(!store.exists(&blob).await.unwrap());

        // Delete again should be idempotent
        assert_eq!(store.delete(&blob).await.unwrap(), BlobDeletion::NotFound);
    }

    #[tokio::test]
    async fn test_filesystem_missing_root_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemBlobStore::new(FilesystemStorageConfig {
            path: dir.path().join("not-mounted").to_string_lossy().to_string(),
        });

        let err = store
            .delete(&BlobReference::new("exports", "a.zip"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(store.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryBlobStore::new();
        let ok = BlobReference::new("b", "ok");
        let bad = BlobReference::new("b", "bad");
        store.put(ok.clone());
        store.put(bad.clone());
        store.fail_on(bad.clone());

        assert_eq!(store.delete(&ok).await.unwrap(), BlobDeletion::Deleted);
        let err = store.delete(&bad).await.unwrap_err();
        assert!(!err.is_unavailable());
        assert!(store.contains(&bad));

        store.heal();
        assert_eq!(store.delete(&bad).await.unwrap(), BlobDeletion::Deleted);
        assert_eq!(store.len(), 0);
        assert_eq!(store.delete_calls(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryBlobStore::new();
        store.set_unavailable(true);
        let err = store
            .delete(&BlobReference::new("b", "x"))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
    }

    #[tokio::test]
    async fn test_create_filesystem_store() {
        let store = create_blob_store(&StorageConfig::default()).await.unwrap();
        assert_eq!(store.backend_name(), "filesystem");
    }

    #[cfg(feature = "s3-storage")]
    #[test]
    fn test_s3_not_found_detection() {
        assert!(S3BlobStore::is_not_found("NoSuchKey: The specified key does not exist"));
        assert!(!S3BlobStore::is_not_found("AccessDenied"));
    }

    #[test]
    fn test_backends_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FilesystemBlobStore>();
        assert_send_sync::<MemoryBlobStore>();
        #[cfg(feature = "s3-storage")]
        assert_send_sync::<S3BlobStore>();
    }
}
