//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Cryptographic errors
    /// Invalid, malformed or off-curve public key.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Handshake errors
    /// Attempted an outbound operation before the handshake completed.
    #[error("connection not ready: handshake has not completed")]
    NotReady,

    /// The peer's handshake payload was missing `key` or `iv`, or was unusable.
    #[error("malformed handshake: {0}")]
    HandshakeMalformed(String),

    // Envelope errors
    /// A decrypted envelope was structurally invalid.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A reply or error arrived for an id with no pending request.
    #[error("unknown correlation id: {0}")]
    UnknownCorrelationId(u64),

    // Connection errors
    /// Connection was closed.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The underlying transport rejected an operation.
    #[error("transport error: {0}")]
    Transport(String),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ProtocolError {
    /// Returns true if the error leaves the connection unusable.
    ///
    /// Cipher failures and undecodable envelopes mean the session state can no
    /// longer be trusted, so the connection is closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPublicKey(_)
                | ProtocolError::Encryption(_)
                | ProtocolError::Decryption(_)
                | ProtocolError::InvalidEnvelope(_)
        )
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;
        match err.classify() {
            Category::Io => ProtocolError::Serialization(err.to_string()),
            Category::Syntax | Category::Data | Category::Eof => {
                ProtocolError::Deserialization(err.to_string())
            }
        }
    }
}

/// Socket failures surface from transports; a peer hanging up is a close.
impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let detail = err.to_string();
        match err.kind() {
            TimedOut | WouldBlock => ProtocolError::Timeout(detail),
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof | NotConnected => {
                ProtocolError::ConnectionClosed(detail)
            }
            _ => ProtocolError::Transport(detail),
        }
    }
}
