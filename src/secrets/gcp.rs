//! GCP Secret Manager implementation.
//!
//! Resolves `secret://` references against Google Cloud Secret Manager using
//! google-cloud-secretmanager-v1 with Application Default Credentials.
//!
//! A reference may name a secret three ways:
//! - short name: `secret://db-url` reads `projects/{project}/secrets/{prefix}db-url/versions/latest`
//! - secret resource: `secret://projects/p/secrets/db-url` reads its latest version
//! - version resource: `secret://projects/p/secrets/db-url/versions/3` reads that version

use async_trait::async_trait;
use google_cloud_secretmanager_v1::client::SecretManagerService;

use super::{SecretError, SecretManager, SecretResult};

/// Configuration for GCP Secret Manager.
#[derive(Debug, Clone)]
pub struct GcpSecretManagerConfig {
    /// GCP project ID used for short names
    pub project_id: String,
    /// Optional prefix for short secret names
    pub prefix: String,
}

impl GcpSecretManagerConfig {
    /// Create a new config with the given project ID.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            prefix: String::new(),
        }
    }

    /// Set the secret name prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Build the secret version resource name for a reference.
    fn version_name(&self, key: &str) -> String {
        if key.starts_with("projects/") {
            if key.contains("/versions/") {
                return key.to_string();
            }
            return format!("{}/versions/latest", key);
        }

        let sanitized_key: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();

        format!(
            "projects/{}/secrets/{}{}/versions/latest",
            self.project_id, self.prefix, sanitized_key
        )
    }
}

/// GCP Secret Manager secret manager.
pub struct GcpSecretManager {
    client: SecretManagerService,
    config: GcpSecretManagerConfig,
}

impl GcpSecretManager {
    /// Create a new GCP Secret Manager client with the given configuration.
    ///
    /// Uses Application Default Credentials which tries:
    /// - GOOGLE_APPLICATION_CREDENTIALS environment variable
    /// - gcloud CLI credentials
    /// - Metadata server (when running in GCP)
    pub async fn new(config: GcpSecretManagerConfig) -> SecretResult<Self> {
        let client = SecretManagerService::builder()
            .build()
            .await
            .map_err(|e| SecretError::Connection(format!("Failed to create GCP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Check if an error is a NOT_FOUND gRPC error.
    fn is_not_found(err: &google_cloud_secretmanager_v1::Error) -> bool {
        // The error message typically contains the gRPC status code
        let err_str = err.to_string();
        err_str.contains("NOT_FOUND") || err_str.contains("status: NotFound")
    }

    /// Check if an error is a PERMISSION_DENIED gRPC error.
    fn is_permission_denied(err: &google_cloud_secretmanager_v1::Error) -> bool {
        let err_str = err.to_string();
        err_str.contains("PERMISSION_DENIED") || err_str.contains("status: PermissionDenied")
    }

    /// Check if an error means the service could not be reached.
    fn is_unavailable(err: &google_cloud_secretmanager_v1::Error) -> bool {
        let err_str = err.to_string();
        err_str.contains("UNAVAILABLE")
            || err_str.contains("DEADLINE_EXCEEDED")
            || err_str.contains("status: Unavailable")
    }
}

#[async_trait]
impl SecretManager for GcpSecretManager {
    async fn get(&self, key: &str) -> SecretResult<Option<String>> {
        let name = self.config.version_name(key);

        match self
            .client
            .access_secret_version()
            .set_name(&name)
            .send()
            .await
        {
            Ok(response) => {
                let Some(payload) = response.payload else {
                    return Ok(None);
                };
                if payload.data.is_empty() {
                    return Ok(None);
                }
                let value = String::from_utf8(payload.data.to_vec()).map_err(|e| {
                    SecretError::Internal(format!("Secret '{}' is not valid UTF-8: {}", key, e))
                })?;

                // JSON payloads of the form {"value": "..."} are unwrapped
                if let Ok(json) = serde_json::from_str::<serde_json::Value>(&value)
                    && let Some(v) = json.get("value").and_then(|v| v.as_str())
                {
                    return Ok(Some(v.to_string()));
                }
                Ok(Some(value))
            }
            Err(err) if Self::is_not_found(&err) => Ok(None),
            Err(err) if Self::is_permission_denied(&err) => Err(SecretError::Auth(format!(
                "Permission denied reading secret '{}': {}",
                key, err
            ))),
            Err(err) if Self::is_unavailable(&err) => Err(SecretError::Connection(format!(
                "GCP Secret Manager unavailable reading '{}': {}",
                key, err
            ))),
            Err(err) => Err(SecretError::Internal(format!(
                "Failed to get secret '{}': {}",
                key, err
            ))),
        }
    }

    async fn health_check(&self) -> SecretResult<()> {
        match self
            .client
            .list_secrets()
            .set_parent(format!("projects/{}", self.config.project_id))
            .set_page_size(1)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                // Permission denied is okay for health check (we can connect)
                if Self::is_permission_denied(&err) {
                    return Ok(());
                }
                Err(SecretError::Connection(format!(
                    "GCP Secret Manager health check failed: {}",
                    err
                )))
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "gcp"
    }
}
