//! # IonNet Protocol Library
//!
//! Encrypted RPC envelopes over any bidirectional, message-oriented transport.
//!
//! ## Overview
//!
//! Two peers, an initiator and an acceptor, exchange P-521 public keys in the
//! clear, derive a shared AES-256-CBC session cipher, and from then on send
//! encrypted JSON envelopes. Envelopes are requests, replies, notifications or
//! errors; replies are matched to requests by a numeric id.
//!
//! - **Session crypto**: key pairs, ECDH and the session cipher
//! - **Handshake**: the plaintext key exchange state machine
//! - **Correlation**: request ids, pending requests and inbound dispatch
//! - **Connection**: the per-peer API composed from the above
//! - **Listener**: turns inbound transports into acceptor connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Application callbacks            │  on_message / send / reply
//! ├─────────────────────────────────────────┤
//! │     Correlation (PendingRequests)       │  id → waiting request
//! ├─────────────────────────────────────────┤
//! │   Envelope JSON + AES-256-CBC (hex)     │  {"i","f","t","o","e"}
//! ├─────────────────────────────────────────┤
//! │    Handshake (plaintext, P-521 ECDH)    │  handshake{"key","iv"}
//! ├─────────────────────────────────────────┤
//! │        Transport (WebSocket, ...)       │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use ionnet_protocol::{ConnectionConfig, CryptoProvider, Envelope, Handshake, HandshakeStep, Role};
//! use serde_json::json;
//!
//! let crypto = CryptoProvider::new();
//! println!("Fingerprint: {}", crypto.key_pair().fingerprint());
//!
//! let config = ConnectionConfig::default();
//! let initiator = Handshake::new(Role::Initiator, crypto.key_pair(), &config);
//! let acceptor = Handshake::new(Role::Acceptor, CryptoProvider::new().key_pair(), &config);
//!
//! let HandshakeStep::Established { cipher, reply } = acceptor.process(&initiator.hello()?)? else {
//!     panic!("handshake failed");
//! };
//! assert!(reply.is_some());
//!
//! let envelope = Envelope::request(0, "echo", json!({"x": 1}));
//! let ciphertext = cipher.encrypt_to_hex(&envelope.to_json()?);
//! assert_eq!(Envelope::from_json(&cipher.decrypt_hex(&ciphertext)?)?, envelope);
//! # Ok::<(), ionnet_protocol::ProtocolError>(())
//! ```
//!
//! ## Modules
//!
//! - [`crypto`]: key pairs, ECDH and the session cipher
//! - [`handshake`]: key exchange state machine
//! - [`messages`]: envelope definitions
//! - [`correlation`]: request/reply matching
//! - [`connection`]: per-peer connection object
//! - [`listener`]: acceptor side of a listening transport
//! - [`transport`]: contract with the underlying transport
//! - [`config`]: per-connection settings
//! - [`error`]: error types

pub mod config;
pub mod connection;
pub mod correlation;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod messages;
pub mod transport;

pub use config::{ConnectionConfig, IvMode, KeyDerivation};
pub use connection::Connection;
pub use correlation::{Dispatch, PendingRequests};
pub use crypto::{
    CryptoProvider, KeyPair, SessionCipher, FINGERPRINT_LENGTH, FIXED_IV, IV_LENGTH,
    SESSION_KEY_LENGTH,
};
pub use error::{ProtocolError, Result};
pub use handshake::{ConnectionState, Handshake, HandshakeStep, Role, HANDSHAKE_TAG};
pub use listener::{Listener, ListenerEvent};
pub use messages::{Envelope, MessageKind, DEFAULT_ERROR_CODE, HANDSHAKE_ERROR_CODE};
pub use transport::{
    memory_pair, TransportEvent, TransportEvents, TransportHandle, TransportSink, WireMessage,
};
