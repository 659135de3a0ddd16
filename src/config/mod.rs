//! Configuration module for the exposure cleanup service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax. Values of the form
//! `secret://NAME` are resolved through the configured secrets manager after
//! parsing (see [`CleanupConfig::resolve_secret_refs`]).
//!
//! # Example
//!
//! ```toml
//! [server]
//! port = 8080
//!
//! [database]
//! type = "postgres"
//! url = "secret://cleanup-database-url"
//!
//! [retention]
//! timeout_secs = 600
//! batch_size = 1000
//!
//! [retention.windows]
//! exposure = 14
//! export = 30
//!
//! [secrets]
//! type = "gcp"
//! project_id = "my-project"
//! ```

mod database;
mod observability;
mod retention;
mod secrets;
mod server;
mod storage;

use std::path::Path;

pub use database::*;
pub use observability::*;
pub use retention::*;
pub use secrets::*;
use serde::{Deserialize, Serialize};
pub use server::*;
pub use storage::*;

use crate::secrets::{SecretError, SecretManager};

/// Prefix marking a config value that must be fetched from the secrets manager.
pub const SECRET_REF_PREFIX: &str = "secret://";

/// Root configuration for the cleanup service.
///
/// All sections are optional with defaults, except that a usable deployment
/// needs `[database]` and at least one entry in `[retention.windows]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CleanupConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database holding exposure records.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Retention windows and run limits.
    #[serde(default)]
    pub retention: RetentionConfig,

    /// Blob storage holding exposure artifacts.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Secrets manager used to resolve `secret://` references.
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl CleanupConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        let mut config: CleanupConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&mut self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.retention.validate()?;
        self.storage.validate().map_err(ConfigError::Validation)?;
        self.server.validate()?;

        if self.observability.metrics.serves_prometheus()
            && self.observability.metrics.path == self.server.trigger_path
        {
            return Err(ConfigError::Validation(format!(
                "observability.metrics.path and server.trigger_path are both '{}'",
                self.server.trigger_path
            )));
        }

        if self.secrets.is_none() && !self.secret_ref_fields().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{} uses a {} reference but no [secrets] manager is configured",
                self.secret_ref_fields().join(", "),
                SECRET_REF_PREFIX
            )));
        }

        Ok(())
    }

    /// Names of the config fields currently holding an unresolved secret reference.
    pub fn secret_ref_fields(&self) -> Vec<&'static str> {
        self.secret_ref_slots_ref()
            .into_iter()
            .filter(|(_, value)| value.is_some_and(|v| v.starts_with(SECRET_REF_PREFIX)))
            .map(|(name, _)| name)
            .collect()
    }

    fn secret_ref_slots_ref(&self) -> Vec<(&'static str, Option<&str>)> {
        let mut slots = Vec::new();
        #[cfg(feature = "database-postgres")]
        if let DatabaseConfig::Postgres(pg) = &self.database {
            slots.push(("database.url", Some(pg.url.as_str())));
            slots.push(("database.read_url", pg.read_url.as_deref()));
        }
        if let Some(s3) = &self.storage.s3 {
            slots.push(("storage.s3.access_key_id", s3.access_key_id.as_deref()));
            slots.push((
                "storage.s3.secret_access_key",
                s3.secret_access_key.as_deref(),
            ));
        }
        slots
    }

    fn secret_ref_slots_mut(&mut self) -> Vec<(&'static str, &mut String)> {
        let mut slots = Vec::new();
        #[cfg(feature = "database-postgres")]
        if let DatabaseConfig::Postgres(pg) = &mut self.database {
            slots.push(("database.url", &mut pg.url));
            if let Some(read_url) = pg.read_url.as_mut() {
                slots.push(("database.read_url", read_url));
            }
        }
        if let Some(s3) = self.storage.s3.as_mut() {
            if let Some(key) = s3.access_key_id.as_mut() {
                slots.push(("storage.s3.access_key_id", key));
            }
            if let Some(secret) = s3.secret_access_key.as_mut() {
                slots.push(("storage.s3.secret_access_key", secret));
            }
        }
        slots
    }

    /// Replace every `secret://NAME` value with the secret it names.
    ///
    /// Fails closed: a missing secret or an unreachable secrets manager aborts
    /// startup rather than falling back to the literal reference.
    pub async fn resolve_secret_refs(
        &mut self,
        secrets: &dyn SecretManager,
    ) -> Result<(), ConfigError> {
        for (field, value) in self.secret_ref_slots_mut() {
            let Some(name) = value.strip_prefix(SECRET_REF_PREFIX) else {
                continue;
            };
            let name = name.to_string();
            let resolved = crate::secrets::resolve(secrets, &name)
                .await
                .map_err(|source| ConfigError::Secret {
                    field,
                    name: name.clone(),
                    source,
                })?;
            tracing::debug!(field, secret = %name, "Resolved secret reference");
            *value = resolved;
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Failed to resolve secret '{name}' for {field}: {source}")]
    Secret {
        field: &'static str,
        name: String,
        #[source]
        source: SecretError,
    },
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid interpolation pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
