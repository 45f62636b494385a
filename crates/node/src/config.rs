//! Configuration management for the IonNet node.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/ionnet/config.toml`.

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ionnet_protocol::ConnectionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 127.0.0.1:1531, got {0}")]
    InvalidListenAddr(String),

    #[error("url must start with ws://, got {0}")]
    InvalidUrl(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),

    #[error("request_timeout_ms must be greater than 0")]
    InvalidRequestTimeout,
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Port used when nothing else is configured.
pub const DEFAULT_PORT: u16 = 1531;

/// Main configuration structure for the IonNet node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General node configuration.
    pub node: NodeConfig,

    /// Where to listen and where to connect.
    pub network: NetworkConfig,

    /// Handshake and request settings applied to every connection.
    pub protocol: ConnectionConfig,
}

/// General node configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server binds to.
    pub listen_addr: String,

    /// WebSocket URL clients connect to.
    pub url: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            url: format!("ws://127.0.0.1:{}", DEFAULT_PORT),
        }
    }
}

impl NetworkConfig {
    /// Parses `listen_addr`.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.listen_addr.clone()))
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ionnet")
        .join("config.toml")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - IONNET_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    /// - IONNET_LISTEN_ADDR: Override the server bind address
    /// - IONNET_URL: Override the URL clients connect to
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("IONNET_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.node.log_level = level;
            }
        }

        if let Ok(addr) = std::env::var("IONNET_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.network.listen_addr = addr;
            }
        }

        if let Ok(url) = std::env::var("IONNET_URL") {
            if !url.is_empty() {
                tracing::info!("Overriding url from environment: {}", url);
                self.network.url = url;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.network.listen_socket_addr()?;

        // Only plain WebSocket is spoken
        if !self.network.url.starts_with("ws://") {
            return Err(ConfigError::InvalidUrl(self.network.url.clone()));
        }

        let level = self.node.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.node.log_level.clone()));
        }

        if self.protocol.validate().is_err() {
            return Err(ConfigError::InvalidRequestTimeout);
        }

        Ok(())
    }

    /// Reads `path`, falling back to defaults when the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Cannot read {}", path.display()));
            }
        };

        Self::from_toml(&contents).with_context(|| format!("Bad config in {}", path.display()))
    }

    /// Reads the file at [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parses a TOML document. Missing tables and keys keep their defaults.
    pub fn from_toml(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| anyhow::anyhow!(describe_toml_error(source, &e)))
    }

    /// Writes the configuration as TOML, creating missing directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        }

        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Cannot write {}", path.display()))?;
        tracing::debug!(path = %path.display(), "config written");
        Ok(())
    }

    /// Renders the configuration as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Points a TOML parse error at its line in `source`.
fn describe_toml_error(source: &str, error: &toml::de::Error) -> String {
    match error.span() {
        Some(span) => {
            let before = source.get(..span.start).unwrap_or(source);
            let line = before.matches('\n').count() + 1;
            format!("line {}: {}", line, error.message())
        }
        None => error.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ionnet_protocol::{IvMode, KeyDerivation};
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.node.log_level, "info");
        assert_eq!(config.network.listen_addr, "127.0.0.1:1531");
        assert_eq!(config.network.url, "ws://127.0.0.1:1531");
        assert_eq!(config.protocol, ConnectionConfig::default());
    }

    #[test]
    fn test_from_toml_empty() {
        // Empty TOML should use all defaults
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[node]
log_level = "debug"

[protocol]
iv_mode = "random"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.log_level, "debug");
        assert_eq!(config.protocol.iv_mode, IvMode::Random);
        // Unspecified values keep their defaults
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.protocol.key_derivation, KeyDerivation::RawPrefix);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[node]
log_level = "warn"

[network]
listen_addr = "0.0.0.0:9000"
url = "ws://example.com:9000"

[protocol]
iv_mode = "fixed"
key_derivation = "hex_prefix"
ephemeral_keys = true
request_timeout_ms = 2500
fail_pending_on_close = false
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.node.log_level, "warn");
        assert_eq!(config.network.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.network.url, "ws://example.com:9000");
        assert_eq!(config.protocol.key_derivation, KeyDerivation::HexPrefix);
        assert!(config.protocol.ephemeral_keys);
        assert_eq!(config.protocol.request_timeout_ms, Some(2500));
        assert!(!config.protocol.fail_pending_on_close);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let err = Config::from_toml("[node]\nlog_level = = \"info\"\n")
            .unwrap_err()
            .to_string();
        assert!(err.starts_with("line 2:"), "{}", err);
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[protocol]
ephemeral_keys = "yes"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut config = Config::default();
        config.node.log_level = "trace".to_string();
        config.network.listen_addr = "0.0.0.0:4000".to_string();
        config.protocol = ConnectionConfig::hardened();

        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");

        let mut config = Config::default();
        config.protocol = ConnectionConfig::legacy();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_save_creates_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("dirs").join("config.toml");

        Config::default().save(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        fs::write(&path, "this is not = [valid toml").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Bad config in"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("ionnet/config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[node]
log_level = "info"
colour = "blue"

[extra]
anything = 1
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.node.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("IONNET_LISTEN_ADDR");
        std::env::remove_var("IONNET_URL");
        std::env::set_var("IONNET_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.node.log_level, "debug");

        // Clean up
        std::env::remove_var("IONNET_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_network() {
        std::env::remove_var("IONNET_LOG_LEVEL");
        std::env::set_var("IONNET_LISTEN_ADDR", "0.0.0.0:7000");
        std::env::set_var("IONNET_URL", "ws://peer.example:7000");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.network.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.network.url, "ws://peer.example:7000");

        // Clean up
        std::env::remove_var("IONNET_LISTEN_ADDR");
        std::env::remove_var("IONNET_URL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("IONNET_LOG_LEVEL", "");
        std::env::set_var("IONNET_URL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        // Should NOT be overridden (empty string is ignored)
        assert_eq!(config, Config::default());

        // Clean up
        std::env::remove_var("IONNET_LOG_LEVEL");
        std::env::remove_var("IONNET_URL");
    }

    #[test]
    #[serial]
    fn test_env_override_unset_does_not_override() {
        std::env::remove_var("IONNET_LOG_LEVEL");
        std::env::remove_var("IONNET_LISTEN_ADDR");
        std::env::remove_var("IONNET_URL");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_listen_addr() {
        let mut config = Config::default();
        config.network.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );

        config.network.listen_addr = "[::1]:1531".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_url() {
        let mut config = Config::default();
        for url in ["http://127.0.0.1:1531", "wss://127.0.0.1:1531", "", "127.0.0.1:1531"] {
            config.network.url = url.to_string();
            assert_eq!(config.validate(), Err(ConfigError::InvalidUrl(url.to_string())));
        }
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.node.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );

        // Case-insensitive
        config.node.log_level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_request_timeout() {
        let mut config = Config::default();
        config.protocol.request_timeout_ms = Some(0);
        assert_eq!(config.validate(), Err(ConfigError::InvalidRequestTimeout));

        config.protocol.request_timeout_ms = Some(1);
        assert!(config.validate().is_ok());
    }
}
