//! Per-connection protocol settings.
//!
//! The defaults reproduce the behaviour of existing IonNet peers: one key pair
//! per process, a constant IV and a raw-prefix session key. The other options
//! trade that compatibility for stronger session separation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// How the session IV is chosen by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvMode {
    /// The process-wide constant [`crate::crypto::FIXED_IV`].
    #[default]
    Fixed,
    /// A fresh random IV per connection, echoed back by the acceptor.
    Random,
}

/// How the 32-byte AES key is taken from the ECDH shared secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyDerivation {
    /// The leading 32 bytes of the raw shared secret.
    #[default]
    RawPrefix,
    /// The ASCII bytes of the first 32 hex digits of the shared secret.
    ///
    /// This is what JavaScript IonNet peers do; use it to talk to them.
    HexPrefix,
}

/// Settings applied to a single [`crate::Connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// IV selection for the session cipher.
    pub iv_mode: IvMode,

    /// Session key derivation from the shared secret.
    pub key_derivation: KeyDerivation,

    /// Generate a key pair per connection instead of using the process-wide one.
    pub ephemeral_keys: bool,

    /// Deadline for a `send` to receive its reply, in milliseconds.
    /// `None` waits until the reply arrives or the connection closes.
    pub request_timeout_ms: Option<u64>,

    /// Complete every outstanding request with `ConnectionClosed` on disconnect.
    pub fail_pending_on_close: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            iv_mode: IvMode::Fixed,
            key_derivation: KeyDerivation::RawPrefix,
            ephemeral_keys: false,
            request_timeout_ms: None,
            fail_pending_on_close: true,
        }
    }
}

impl ConnectionConfig {
    /// Hardened settings: per-connection keys and a random IV.
    pub fn hardened() -> Self {
        Self {
            iv_mode: IvMode::Random,
            ephemeral_keys: true,
            ..Self::default()
        }
    }

    /// Settings that interoperate with JavaScript IonNet peers.
    pub fn legacy() -> Self {
        Self {
            key_derivation: KeyDerivation::HexPrefix,
            ..Self::default()
        }
    }

    /// Returns the request timeout as a `Duration`.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Sets the request timeout. Durations beyond `u64::MAX` ms saturate.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Validate the configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == Some(0) {
            return Err(ProtocolError::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ConnectionConfig::default();
        assert_eq!(config.iv_mode, IvMode::Fixed);
        assert_eq!(config.key_derivation, KeyDerivation::RawPrefix);
        assert!(!config.ephemeral_keys);
        assert!(config.request_timeout().is_none());
        assert!(config.fail_pending_on_close);
    }

    #[test]
    fn test_hardened_config() {
        let config = ConnectionConfig::hardened();
        assert_eq!(config.iv_mode, IvMode::Random);
        assert!(config.ephemeral_keys);
        assert_eq!(config.key_derivation, KeyDerivation::RawPrefix);
    }

    #[test]
    fn test_legacy_config() {
        let config = ConnectionConfig::legacy();
        assert_eq!(config.key_derivation, KeyDerivation::HexPrefix);
        assert_eq!(config.iv_mode, IvMode::Fixed);
    }

    #[test]
    fn test_request_timeout_roundtrip() {
        let config = ConnectionConfig::default().with_request_timeout(Duration::from_secs(3));
        assert_eq!(config.request_timeout_ms, Some(3000));
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_huge_request_timeout_saturates() {
        let config = ConnectionConfig::default().with_request_timeout(Duration::MAX);
        assert_eq!(config.request_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let config = ConnectionConfig {
            request_timeout_ms: Some(0),
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ConnectionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_serde_snake_case_modes() {
        let json = r#"{"iv_mode":"random","key_derivation":"hex_prefix"}"#;
        let config: ConnectionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.iv_mode, IvMode::Random);
        assert_eq!(config.key_derivation, KeyDerivation::HexPrefix);
        // Missing fields fall back to defaults
        assert!(config.fail_pending_on_close);
    }
}
