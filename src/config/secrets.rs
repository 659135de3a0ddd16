//! Secrets manager configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the secrets manager used to resolve `secret://`
/// references in the rest of the config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum SecretsConfig {
    /// No secrets manager. Any `secret://` reference is a config error.
    #[default]
    None,

    /// Environment variable-based secrets
    /// Keys are looked up directly as environment variable names.
    Env,

    /// GCP Secret Manager. Requires the `secrets-gcp` feature.
    #[cfg(feature = "secrets-gcp")]
    Gcp(GcpSecretsConfig),
}

impl SecretsConfig {
    pub fn is_none(&self) -> bool {
        matches!(self, SecretsConfig::None)
    }
}

#[cfg(feature = "secrets-gcp")]
/// Configuration for GCP Secret Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcpSecretsConfig {
    /// GCP project ID
    pub project_id: String,

    /// Prefix for short secret names (default: none).
    /// Fully-qualified `projects/...` names are used as-is.
    #[serde(default)]
    pub prefix: String,
}
