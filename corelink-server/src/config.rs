//! File and environment configuration for server deployments.
//!
//! Loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CORELINK_CONFIG)
//! 3. Environment variables

use crate::server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),
}

/// Deployment configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub protocol: ProtocolConfig,
}

/// Bind addresses per transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub tcp_bind: String,
    pub websocket_bind: String,
    pub websocket_path: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tcp_bind: "127.0.0.1:8080".to_string(),
            websocket_bind: "127.0.0.1:8081".to_string(),
            websocket_path: "/websocket".to_string(),
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("CORELINK_TCP_BIND") {
            self.tcp_bind = addr;
        }
        if let Ok(addr) = std::env::var("CORELINK_WS_BIND") {
            self.websocket_bind = addr;
        }
        if let Ok(path) = std::env::var("CORELINK_WS_PATH") {
            self.websocket_path = path;
        }
    }
}

/// Wire-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Per-read deadline in seconds; 0 disables the deadline.
    pub timeout_secs: u64,
    pub max_payload: u32,
    pub content_type: String,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 0,
            max_payload: corelink_protocol::MAX_PAYLOAD,
            content_type: corelink_protocol::codec::JSON.to_string(),
            read_buffer_size: crate::server::DEFAULT_READ_BUFFER_SIZE,
            write_buffer_size: crate::server::DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

impl ProtocolConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(secs) = std::env::var("CORELINK_TIMEOUT_SECS") {
            if let Ok(parsed) = secs.parse() {
                self.timeout_secs = parsed;
            }
        }
        if let Ok(max) = std::env::var("CORELINK_MAX_PAYLOAD") {
            if let Ok(parsed) = max.parse() {
                self.max_payload = parsed;
            }
        }
        if let Ok(content_type) = std::env::var("CORELINK_CONTENT_TYPE") {
            self.content_type = content_type;
        }
    }
}

impl Config {
    /// Loads configuration from file (if CORELINK_CONFIG is set), then
    /// applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("CORELINK_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.protocol.apply_env_overrides();
    }

    /// Builds runtime server options from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new()
            .with_timeout(Duration::from_secs(self.protocol.timeout_secs))
            .with_max_payload(self.protocol.max_payload)
            .with_content_type(self.protocol.content_type.clone())
            .with_read_buffer_size(self.protocol.read_buffer_size)
            .with_write_buffer_size(self.protocol.write_buffer_size)
            .with_websocket_path(self.network.websocket_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.network.tcp_bind, "127.0.0.1:8080");
        assert_eq!(config.network.websocket_path, "/websocket");
        assert_eq!(config.protocol.max_payload, 2048);
        assert_eq!(config.protocol.content_type, "text/json");
        assert_eq!(config.protocol.timeout_secs, 0);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
network:
  tcp_bind: "0.0.0.0:9000"
protocol:
  max_payload: 8192
  content_type: "application/msgpack"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.network.tcp_bind, "0.0.0.0:9000");
        // Unspecified sections keep defaults.
        assert_eq!(config.network.websocket_bind, "127.0.0.1:8081");
        assert_eq!(config.protocol.max_payload, 8192);
        assert_eq!(config.protocol.content_type, "application/msgpack");
    }

    #[test]
    fn test_server_config_bridge() {
        let mut config = Config::default();
        config.protocol.timeout_secs = 30;
        config.protocol.max_payload = 4096;

        let server_config = config.server_config();
        assert_eq!(server_config.timeout, Duration::from_secs(30));
        assert_eq!(server_config.max_payload, 4096);
    }

    #[test]
    fn test_missing_file_errors() {
        let err = Config::from_file("/nonexistent/corelink.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }
}
