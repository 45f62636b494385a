//! Plaintext key-exchange handshake.
//!
//! ```text
//! initiator                                   acceptor
//!     | -- handshake{"key":K_i,"iv":IV} -------> |  derive(K_i, IV), Authenticated
//!     | <------- handshake{"key":K_a,"iv":IV} -- |
//!     derive(K_a, IV), Authenticated
//! ```
//!
//! The state machine here is pure: it parses inbound plaintext and tells the
//! caller what to transmit. [`crate::Connection`] performs the I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, IvMode, KeyDerivation};
use crate::crypto::{parse_iv, random_iv, KeyPair, SessionCipher, FIXED_IV, IV_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::messages::Envelope;

/// Literal prefix of every handshake message.
pub const HANDSHAKE_TAG: &str = "handshake";

/// Role of a connection in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opened the transport and speaks first.
    Initiator,
    /// Received the transport and answers the initiator's hello.
    Acceptor,
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session cipher yet; only handshake traffic is understood.
    Unauthenticated,
    /// Session cipher derived; envelopes flow encrypted.
    Authenticated,
    /// Transport closed.
    Closed,
}

/// Payload of a handshake message, as it appears on the wire.
///
/// Both fields are optional so that a peer omitting one can be told so.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeHello {
    /// Hex-encoded P-521 public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Session IV string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl HandshakeHello {
    /// Encodes as `handshake{"key":..,"iv":..}`.
    pub fn encode(&self) -> Result<String> {
        Ok(format!("{}{}", HANDSHAKE_TAG, serde_json::to_string(self)?))
    }

    /// Parses a message carrying the handshake tag.
    ///
    /// Returns `None` if the message does not start with the tag.
    pub fn decode(message: &str) -> Option<Result<Self>> {
        let body = message.strip_prefix(HANDSHAKE_TAG)?;
        Some(
            serde_json::from_str(body)
                .map_err(|e| ProtocolError::HandshakeMalformed(format!("unparsable payload: {}", e))),
        )
    }
}

/// What the connection must do after feeding a plaintext message to the handshake.
#[derive(Debug)]
pub enum HandshakeStep {
    /// The session cipher is ready. `reply` is the acceptor's own hello.
    Established {
        cipher: SessionCipher,
        reply: Option<String>,
    },
    /// The peer's hello was malformed; `reply` is the plaintext error envelope.
    Rejected {
        error: ProtocolError,
        reply: String,
    },
    /// A non-handshake message arrived; resend our hello.
    Restart { reply: String },
    /// The peer rejected our hello. Logged, never answered.
    PeerRejected,
}

/// Handshake logic for one connection.
pub struct Handshake {
    role: Role,
    keys: Arc<KeyPair>,
    iv: String,
    derivation: KeyDerivation,
    // Set once an acceptor has re-sent its hello; its IV is then binding.
    advertised: AtomicBool,
}

impl Handshake {
    /// Creates the handshake for a connection using the given key pair.
    pub fn new(role: Role, keys: Arc<KeyPair>, config: &ConnectionConfig) -> Self {
        let iv = match config.iv_mode {
            IvMode::Fixed => FIXED_IV.to_string(),
            IvMode::Random => random_iv(),
        };

        Self {
            role,
            keys,
            iv,
            derivation: config.key_derivation,
            advertised: AtomicBool::new(false),
        }
    }

    /// Returns the role in the handshake.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Returns the key pair this handshake advertises.
    pub fn key_pair(&self) -> &Arc<KeyPair> {
        &self.keys
    }

    /// Our hello, advertising our public key and proposed IV.
    pub fn hello(&self) -> Result<String> {
        self.hello_with_iv(&self.iv)
    }

    fn hello_with_iv(&self, iv: &str) -> Result<String> {
        HandshakeHello {
            key: Some(self.keys.public_key_hex().to_string()),
            iv: Some(iv.to_string()),
        }
        .encode()
    }

    /// Processes a plaintext message received while unauthenticated.
    ///
    /// Returns `Err` only for failures that make the connection unusable, such
    /// as an invalid peer public key.
    pub fn process(&self, message: &str) -> Result<HandshakeStep> {
        let hello = match HandshakeHello::decode(message) {
            Some(Ok(hello)) => hello,
            Some(Err(error)) => return self.reject(error),
            None => {
                if Envelope::from_json(message).is_ok_and(|env| env.is_handshake_error()) {
                    return Ok(HandshakeStep::PeerRejected);
                }
                let reply = self.hello()?;
                if self.role == Role::Acceptor {
                    self.advertised.store(true, Ordering::Release);
                }
                return Ok(HandshakeStep::Restart { reply });
            }
        };

        let (key, iv) = match (hello.key, hello.iv) {
            (Some(key), Some(iv)) if !key.is_empty() && !iv.is_empty() => (key, iv),
            (key, _) => {
                let missing = if key.as_deref().map_or(true, str::is_empty) {
                    "key"
                } else {
                    "iv"
                };
                return self.reject(ProtocolError::HandshakeMalformed(format!(
                    "missing {}",
                    missing
                )));
            }
        };

        if parse_iv(&iv).is_none() {
            return self.reject(ProtocolError::HandshakeMalformed(format!(
                "iv must be exactly {} bytes, got {}",
                IV_LENGTH,
                iv.len()
            )));
        }

        // The initiator adopts the first hello it sees. An acceptor that
        // already sent its own hello keeps that IV, otherwise it adopts the
        // proposed one and echoes it.
        let iv = match self.role {
            Role::Acceptor if self.advertised.load(Ordering::Acquire) => self.iv.clone(),
            _ => iv,
        };
        let cipher = self.keys.build_cipher(&key, &iv, self.derivation)?;

        let reply = match self.role {
            Role::Acceptor => Some(self.hello_with_iv(&iv)?),
            Role::Initiator => None,
        };

        Ok(HandshakeStep::Established { cipher, reply })
    }

    fn reject(&self, error: ProtocolError) -> Result<HandshakeStep> {
        Ok(HandshakeStep::Rejected {
            error,
            reply: Envelope::handshake_error().to_json()?,
        })
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("role", &self.role)
            .field("fingerprint", &self.keys.fingerprint())
            .field("derivation", &self.derivation)
            .field("advertised", &self.advertised.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(config: &ConnectionConfig) -> (Handshake, Handshake) {
        let initiator = Handshake::new(Role::Initiator, Arc::new(KeyPair::generate()), config);
        let acceptor = Handshake::new(Role::Acceptor, Arc::new(KeyPair::generate()), config);
        (initiator, acceptor)
    }

    fn establish(step: HandshakeStep) -> (SessionCipher, Option<String>) {
        match step {
            HandshakeStep::Established { cipher, reply } => (cipher, reply),
            other => panic!("expected Established, got {:?}", other),
        }
    }

    #[test]
    fn test_hello_format() {
        let config = ConnectionConfig::default();
        let (initiator, _) = pair(&config);
        let hello = initiator.hello().unwrap();

        assert!(hello.starts_with("handshake{"));
        let parsed = HandshakeHello::decode(&hello).unwrap().unwrap();
        assert_eq!(parsed.key.as_deref(), Some(initiator.key_pair().public_key_hex()));
        assert_eq!(parsed.iv.as_deref(), Some(FIXED_IV));
    }

    #[test]
    fn test_full_handshake() {
        let config = ConnectionConfig::default();
        let (initiator, acceptor) = pair(&config);

        // Acceptor receives the initiator's hello
        let (acceptor_cipher, reply) = establish(acceptor.process(&initiator.hello().unwrap()).unwrap());
        let reply = reply.expect("acceptor must answer with its own hello");

        // Initiator receives the acceptor's hello and does not answer
        let (initiator_cipher, none) = establish(initiator.process(&reply).unwrap());
        assert!(none.is_none());

        let ciphertext = initiator_cipher.encrypt_to_hex("ping");
        assert_eq!(acceptor_cipher.decrypt_hex(&ciphertext).unwrap(), "ping");
        let ciphertext = acceptor_cipher.encrypt_to_hex("pong");
        assert_eq!(initiator_cipher.decrypt_hex(&ciphertext).unwrap(), "pong");
    }

    #[test]
    fn test_random_iv_is_echoed_by_acceptor() {
        let config = ConnectionConfig::hardened();
        let (initiator, acceptor) = pair(&config);

        let hello = initiator.hello().unwrap();
        let proposed = HandshakeHello::decode(&hello).unwrap().unwrap().iv.unwrap();
        assert_ne!(proposed, FIXED_IV);

        let (acceptor_cipher, reply) = establish(acceptor.process(&hello).unwrap());
        let reply = reply.unwrap();
        let echoed = HandshakeHello::decode(&reply).unwrap().unwrap().iv.unwrap();
        assert_eq!(echoed, proposed);

        let (initiator_cipher, _) = establish(initiator.process(&reply).unwrap());
        assert_eq!(initiator_cipher.iv(), acceptor_cipher.iv());
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let (_, acceptor) = pair(&ConnectionConfig::default());
        let step = acceptor.process(r#"handshake{"iv":"a2xhcgAAAAAAAAAA"}"#).unwrap();

        match step {
            HandshakeStep::Rejected { error, reply } => {
                assert!(matches!(error, ProtocolError::HandshakeMalformed(ref m) if m.contains("key")));
                let envelope = Envelope::from_json(&reply).unwrap();
                assert!(envelope.is_handshake_error());
                assert_eq!(envelope.code, Some(4));
            }
            other => panic!("expected Rejected, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_iv_is_rejected() {
        let (initiator, acceptor) = pair(&ConnectionConfig::default());
        let message = format!(
            r#"handshake{{"key":"{}"}}"#,
            initiator.key_pair().public_key_hex()
        );
        let step = acceptor.process(&message).unwrap();
        assert!(matches!(
            step,
            HandshakeStep::Rejected { error: ProtocolError::HandshakeMalformed(ref m), .. } if m.contains("iv")
        ));
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let (_, acceptor) = pair(&ConnectionConfig::default());
        let step = acceptor.process(r#"handshake{"key":"","iv":""}"#).unwrap();
        assert!(matches!(step, HandshakeStep::Rejected { .. }));
    }

    #[test]
    fn test_unparsable_payload_is_rejected() {
        let (_, acceptor) = pair(&ConnectionConfig::default());
        let step = acceptor.process("handshake{not json").unwrap();
        assert!(matches!(step, HandshakeStep::Rejected { .. }));
    }

    #[test]
    fn test_wrong_iv_length_is_rejected() {
        let (initiator, acceptor) = pair(&ConnectionConfig::default());
        let message = HandshakeHello {
            key: Some(initiator.key_pair().public_key_hex().to_string()),
            iv: Some("short".to_string()),
        }
        .encode()
        .unwrap();
        assert!(matches!(
            acceptor.process(&message).unwrap(),
            HandshakeStep::Rejected { .. }
        ));
    }

    #[test]
    fn test_invalid_public_key_is_fatal() {
        let (_, acceptor) = pair(&ConnectionConfig::default());
        let message = r#"handshake{"key":"04deadbeef","iv":"a2xhcgAAAAAAAAAA"}"#;
        let err = acceptor.process(message).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPublicKey(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_non_handshake_message_restarts() {
        let (initiator, _) = pair(&ConnectionConfig::default());
        match initiator.process("hello there").unwrap() {
            HandshakeStep::Restart { reply } => assert_eq!(reply, initiator.hello().unwrap()),
            other => panic!("expected Restart, got {:?}", other),
        }
    }

    #[test]
    fn test_acceptor_keeps_iv_after_resending_hello() {
        let config = ConnectionConfig::hardened();
        let (initiator, acceptor) = pair(&config);

        // Stray traffic makes the acceptor advertise its own random IV first
        let restart = match acceptor.process("junk").unwrap() {
            HandshakeStep::Restart { reply } => reply,
            other => panic!("expected Restart, got {:?}", other),
        };
        let advertised = HandshakeHello::decode(&restart).unwrap().unwrap().iv.unwrap();

        // The initiator sees the acceptor's hello before its own is answered
        let (initiator_cipher, _) = establish(initiator.process(&restart).unwrap());
        let (acceptor_cipher, reply) =
            establish(acceptor.process(&initiator.hello().unwrap()).unwrap());

        let echoed = HandshakeHello::decode(&reply.unwrap()).unwrap().unwrap().iv.unwrap();
        assert_eq!(echoed, advertised);
        assert_eq!(initiator_cipher.iv(), acceptor_cipher.iv());

        let ciphertext = initiator_cipher.encrypt_to_hex("ping");
        assert_eq!(acceptor_cipher.decrypt_hex(&ciphertext).unwrap(), "ping");
    }

    #[test]
    fn test_peer_rejection_is_not_answered() {
        let (initiator, _) = pair(&ConnectionConfig::default());
        let error = Envelope::handshake_error().to_json().unwrap();
        assert!(matches!(
            initiator.process(&error).unwrap(),
            HandshakeStep::PeerRejected
        ));
    }

    #[test]
    fn test_legacy_derivation_agrees() {
        let config = ConnectionConfig::legacy();
        let (initiator, acceptor) = pair(&config);

        let (acceptor_cipher, reply) = establish(acceptor.process(&initiator.hello().unwrap()).unwrap());
        let (initiator_cipher, _) = establish(initiator.process(&reply.unwrap()).unwrap());

        let ciphertext = acceptor_cipher.encrypt_to_hex("{}");
        assert_eq!(initiator_cipher.decrypt_hex(&ciphertext).unwrap(), "{}");
    }
}
