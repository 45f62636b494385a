//! Envelope definitions for IonNet.
//!
//! After the handshake every application message is an [`Envelope`] encoded
//! as JSON and then encrypted. The wire field names are single letters:
//!
//! | field | meaning                                   |
//! |-------|-------------------------------------------|
//! | `i`   | correlation id (optional)                 |
//! | `f`   | endpoint / function name                  |
//! | `t`   | [`MessageKind`] as an integer             |
//! | `o`   | opaque JSON payload (optional)            |
//! | `e`   | error code, only on [`MessageKind::Error`] |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Error code used when a handshake payload is missing `key` or `iv`.
pub const HANDSHAKE_ERROR_CODE: i64 = 4;

/// Endpoint name carried by handshake error envelopes.
pub const HANDSHAKE_ENDPOINT: &str = "handshake";

/// Error code used by [`Envelope::error`] callers that have nothing more specific.
pub const DEFAULT_ERROR_CODE: i64 = -1;

/// The kind of an envelope, serialized as its integer value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    /// Protocol utility message.
    Util = 0,
    /// Request expecting a correlated reply.
    Send = 1,
    /// Reply to a request.
    Reply = 2,
    /// Fire-and-forget notification.
    Push = 3,
    /// Error, correlated when it carries an id.
    Error = 4,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Util),
            1 => Ok(MessageKind::Send),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Push),
            4 => Ok(MessageKind::Error),
            other => Err(ProtocolError::InvalidEnvelope(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// The unit exchanged once a connection is authenticated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id.
    #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,

    /// Endpoint (function) name.
    #[serde(rename = "f", default)]
    pub endpoint: String,

    /// Message kind.
    #[serde(rename = "t")]
    pub kind: MessageKind,

    /// Opaque payload.
    #[serde(rename = "o", default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Error code.
    #[serde(rename = "e", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl Envelope {
    /// A request carrying the given correlation id.
    pub fn request(id: u64, endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id),
            endpoint: endpoint.into(),
            kind: MessageKind::Send,
            payload: Some(payload),
            code: None,
        }
    }

    /// A reply echoing a request's id.
    pub fn reply(id: u64, endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Some(id),
            endpoint: endpoint.into(),
            kind: MessageKind::Reply,
            payload: Some(payload),
            code: None,
        }
    }

    /// A notification with no id.
    pub fn push(endpoint: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            endpoint: endpoint.into(),
            kind: MessageKind::Push,
            payload: Some(payload),
            code: None,
        }
    }

    /// An error, optionally correlated with a request and carrying a payload.
    pub fn error(
        id: Option<u64>,
        endpoint: impl Into<String>,
        code: i64,
        payload: Option<Value>,
    ) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
            kind: MessageKind::Error,
            payload,
            code: Some(code),
        }
    }

    /// A protocol utility message.
    pub fn util(endpoint: impl Into<String>, payload: Option<Value>) -> Self {
        Self {
            id: None,
            endpoint: endpoint.into(),
            kind: MessageKind::Util,
            payload,
            code: None,
        }
    }

    /// The plaintext error sent when a peer's handshake is malformed.
    pub fn handshake_error() -> Self {
        Self::error(None, HANDSHAKE_ENDPOINT, HANDSHAKE_ERROR_CODE, None)
    }

    /// Returns the id of the pending request this envelope completes, if any.
    ///
    /// Replies always complete a request; errors only when they carry an id.
    /// Everything else goes to the generic message handler.
    pub fn correlation_id(&self) -> Option<u64> {
        match self.kind {
            MessageKind::Reply => self.id,
            MessageKind::Error => self.id,
            MessageKind::Util | MessageKind::Send | MessageKind::Push => None,
        }
    }

    /// Returns true if this is the plaintext handshake error.
    pub fn is_handshake_error(&self) -> bool {
        self.kind == MessageKind::Error
            && self.id.is_none()
            && self.endpoint == HANDSHAKE_ENDPOINT
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from JSON.
    ///
    /// Anything that is not a well-formed envelope is reported as
    /// [`ProtocolError::InvalidEnvelope`].
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }
}
