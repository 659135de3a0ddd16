use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path the scheduler calls to trigger a cleanup run.
    /// Accepts both GET and POST.
    #[serde(default = "default_trigger_path")]
    pub trigger_path: String,

    /// Request body size limit in bytes. Triggers carry no body.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trigger_path: default_trigger_path(),
            body_limit_bytes: default_body_limit(),
        }
    }
}

impl ServerConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if !self.trigger_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "server.trigger_path must start with '/', got '{}'",
                self.trigger_path
            )));
        }
        if self.trigger_path.starts_with("/health") {
            return Err(ConfigError::Validation(
                "server.trigger_path cannot shadow the /health routes".into(),
            ));
        }
        Ok(())
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_trigger_path() -> String {
    "/".to_string()
}

fn default_body_limit() -> usize {
    64 * 1024 // 64 KB
}
