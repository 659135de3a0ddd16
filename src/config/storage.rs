//! Blob storage configuration.
//!
//! Exposure artifacts referenced by `(bucket, object_name)` live in one of:
//! - **Filesystem**: each bucket is a sub-directory of a root path
//! - **S3**: S3-compatible object storage; the bucket is the S3 bucket
//!
//! # Example Configuration
//!
//! ```toml
//! [storage]
//! backend = "s3"
//!
//! [storage.s3]
//! region = "us-east-1"
//! # Credentials via env vars AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY,
//! # an IAM role, or secret:// references
//!
//! [storage.filesystem]
//! path = "/var/lib/exposure-cleanup/blobs"
//! ```

use serde::{Deserialize, Serialize};

/// Blob storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Storage backend to use.
    #[serde(default)]
    pub backend: StorageBackend,

    /// S3 configuration (required when backend = "s3").
    #[serde(default)]
    pub s3: Option<S3StorageConfig>,

    /// Filesystem configuration.
    #[serde(default)]
    pub filesystem: FilesystemStorageConfig,
}

impl StorageConfig {
    /// Validate the storage configuration.
    pub fn validate(&self) -> Result<(), String> {
        match self.backend {
            StorageBackend::Filesystem => self.filesystem.validate(),
            StorageBackend::S3 => match &self.s3 {
                Some(s3) => s3.validate(),
                None => Err("S3 storage backend requires [storage.s3] configuration".to_string()),
            },
        }
    }
}

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Blobs are files under a local root directory.
    #[default]
    Filesystem,

    /// Blobs are objects in S3-compatible storage.
    /// Supports AWS S3, MinIO, R2, GCS interoperability mode, etc.
    S3,
}

/// S3-compatible object storage configuration.
///
/// The bucket is taken from each blob reference, so one client serves every
/// bucket the records point at.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3StorageConfig {
    /// AWS region (e.g., "us-east-1").
    /// For non-AWS S3-compatible services, use their region name.
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint URL for S3-compatible services.
    /// Examples:
    /// - MinIO: "http://localhost:9000"
    /// - GCS: "https://storage.googleapis.com"
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Access key ID. May be a `secret://NAME` reference.
    /// If not specified, uses environment variables or IAM role.
    #[serde(default)]
    pub access_key_id: Option<String>,

    /// Secret access key. May be a `secret://NAME` reference.
    /// If not specified, uses environment variables or IAM role.
    #[serde(default)]
    pub secret_access_key: Option<String>,

    /// Use path-style URLs instead of virtual-hosted style.
    /// Required for MinIO and some S3-compatible services.
    #[serde(default)]
    pub force_path_style: bool,

    /// Prefix prepended to every object name.
    #[serde(default)]
    pub key_prefix: Option<String>,
}

impl std::fmt::Debug for S3StorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3StorageConfig")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field(
                "access_key_id",
                &self.access_key_id.as_ref().map(|_| "****"),
            )
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "****"),
            )
            .field("force_path_style", &self.force_path_style)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl S3StorageConfig {
    /// Validate S3 configuration.
    pub fn validate(&self) -> Result<(), String> {
        // Region is required unless using a custom endpoint
        if self.region.is_none() && self.endpoint.is_none() {
            return Err("S3 requires either 'region' or 'endpoint' to be specified".to_string());
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            return Err(
                "S3 access_key_id and secret_access_key must be set together".to_string(),
            );
        }
        Ok(())
    }

    /// Get the full object key for an object name.
    pub fn object_key(&self, object_name: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{}{}", prefix, object_name),
            None => object_name.to_string(),
        }
    }
}

/// Local filesystem storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemStorageConfig {
    /// Root directory. Bucket names are sub-directories of this path.
    #[serde(default = "default_filesystem_path")]
    pub path: String,
}

impl Default for FilesystemStorageConfig {
    fn default() -> Self {
        Self {
            path: default_filesystem_path(),
        }
    }
}

fn default_filesystem_path() -> String {
    "./data/blobs".to_string()
}

impl FilesystemStorageConfig {
    /// Validate filesystem configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.path.is_empty() {
            return Err("Filesystem storage path cannot be empty".to_string());
        }
        Ok(())
    }
}
