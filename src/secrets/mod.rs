//! Secrets management for database URLs, storage credentials and other
//! sensitive config values.
//!
//! Supports multiple backends:
//! - Environment variables (default for local development)
//! - In-memory (tests only)
//! - GCP Secret Manager - requires `secrets-gcp` feature

#[cfg(feature = "secrets-gcp")]
mod gcp;

use std::sync::Arc;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
#[cfg(feature = "secrets-gcp")]
pub use gcp::{GcpSecretManager, GcpSecretManagerConfig};
use thiserror::Error;

use crate::config::SecretsConfig;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Secret not found: {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SecretResult<T> = Result<T, SecretError>;

/// Trait for reading secrets from a backing store.
#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Get a secret by key. Returns None if not found.
    async fn get(&self, key: &str) -> SecretResult<Option<String>>;

    /// Check if the secret manager is healthy/connected.
    async fn health_check(&self) -> SecretResult<()> {
        Ok(())
    }

    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}

/// Resolve a secret, failing closed.
///
/// A missing or empty secret is [`SecretError::NotFound`]; backend failures
/// propagate unchanged.
pub async fn resolve(secrets: &dyn SecretManager, key: &str) -> SecretResult<String> {
    match secrets.get(key).await? {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(SecretError::NotFound(key.to_string())),
    }
}

/// Build the configured secret manager. Returns `None` when no manager is
/// configured.
pub async fn create_secret_manager(
    config: &SecretsConfig,
) -> SecretResult<Option<Arc<dyn SecretManager>>> {
    match config {
        SecretsConfig::None => Ok(None),
        SecretsConfig::Env => {
            tracing::info!("Using environment variables for secrets");
            Ok(Some(Arc::new(EnvSecretManager::new())))
        }
        #[cfg(feature = "secrets-gcp")]
        SecretsConfig::Gcp(gcp) => {
            let manager = GcpSecretManager::new(
                GcpSecretManagerConfig::new(&gcp.project_id).with_prefix(&gcp.prefix),
            )
            .await?;
            manager.health_check().await?;
            tracing::info!(project_id = %gcp.project_id, "Connected to GCP Secret Manager");
            Ok(Some(Arc::new(manager)))
        }
    }
}

/// In-memory secret manager (for testing only)
#[cfg(test)]
pub struct MemorySecretManager {
    secrets: Arc<dashmap::DashMap<String, String>>,
    unavailable: AtomicBool,
}

#[cfg(test)]
impl MemorySecretManager {
    pub fn new() -> Self {
        Self {
            secrets: Arc::new(dashmap::DashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Store a secret.
    pub fn insert(&self, key: &str, value: &str) {
        self.secrets.insert(key.to_string(), value.to_string());
    }

    /// Make every subsequent call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> SecretResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SecretError::Connection(
                "memory secret manager marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
impl Default for MemorySecretManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl SecretManager for MemorySecretManager {
    async fn get(&self, key: &str) -> SecretResult<Option<String>> {
        self.check_available()?;
        Ok(self.secrets.get(key).map(|v| v.value().clone()))
    }

    async fn health_check(&self) -> SecretResult<()> {
        self.check_available()
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Environment-based secret manager (reads from env vars)
pub struct EnvSecretManager;

impl EnvSecretManager {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EnvSecretManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretManager for EnvSecretManager {
    async fn get(&self, key: &str) -> SecretResult<Option<String>> {
        Ok(std::env::var(key).ok())
    }

    fn backend_name(&self) -> &'static str {
        "env"
    }
}
