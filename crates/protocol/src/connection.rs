//! Per-connection protocol object.
//!
//! A [`Connection`] owns one transport, runs the handshake over it and then
//! exchanges encrypted [`Envelope`]s. Inbound transport events are processed
//! by a single driver task, so handshake and dispatch never race each other.
//! Outbound operations may be called from any task.
//!
//! ```rust,no_run
//! # async fn demo() -> ionnet_protocol::Result<()> {
//! use ionnet_protocol::{memory_pair, Connection, ConnectionConfig, CryptoProvider, Role};
//! use serde_json::json;
//!
//! let crypto = CryptoProvider::new();
//! let (a, b) = memory_pair();
//! let client = Connection::attach(Role::Initiator, &crypto, a, ConnectionConfig::default());
//! let server = Connection::attach(Role::Acceptor, &crypto, b, ConnectionConfig::default());
//! server.on_message(|conn, envelope| {
//!     let conn = conn.clone();
//!     tokio::spawn(async move {
//!         if let Some(id) = envelope.id {
//!             let _ = conn.reply(&envelope.endpoint, id, envelope.payload.unwrap_or_default()).await;
//!         }
//!     });
//! });
//!
//! client.wait_ready().await?;
//! let reply = client.send("echo", json!({"x": 1})).await?;
//! assert_eq!(reply.payload, Some(json!({"x": 1})));
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ConnectionConfig;
use crate::correlation::{Dispatch, PendingRequests};
use crate::crypto::{CryptoProvider, KeyPair, SessionCipher};
use crate::error::{ProtocolError, Result};
use crate::handshake::{ConnectionState, Handshake, HandshakeStep, Role, HANDSHAKE_TAG};
use crate::messages::Envelope;
use crate::transport::{TransportEvent, TransportEvents, TransportHandle, TransportSink, WireMessage};

type MessageCallback = Arc<dyn Fn(&Arc<Connection>, Envelope) + Send + Sync>;
type ReadyCallback = Box<dyn FnOnce(&Arc<Connection>) + Send>;
type DisconnectCallback = Box<dyn FnOnce() + Send>;

/// An encrypted RPC connection to one peer.
pub struct Connection {
    handshake: Handshake,
    config: ConnectionConfig,
    sink: Arc<dyn TransportSink>,
    cipher: OnceLock<SessionCipher>,
    state: watch::Sender<ConnectionState>,
    pending: PendingRequests,
    on_message: Mutex<Option<MessageCallback>>,
    on_ready: Mutex<Option<ReadyCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Connection {
    /// Creates a connection over `sink`.
    ///
    /// The connection uses the provider's current key pair, or a fresh one
    /// when `config.ephemeral_keys` is set. Nothing happens until transport
    /// events are fed to it with [`Connection::spawn`].
    pub fn new(
        role: Role,
        crypto: &CryptoProvider,
        sink: Arc<dyn TransportSink>,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let keys = if config.ephemeral_keys {
            Arc::new(KeyPair::generate())
        } else {
            crypto.key_pair()
        };
        let (state, _) = watch::channel(ConnectionState::Unauthenticated);

        Arc::new(Self {
            handshake: Handshake::new(role, keys, &config),
            config,
            sink,
            cipher: OnceLock::new(),
            state,
            pending: PendingRequests::new(),
            on_message: Mutex::new(None),
            on_ready: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        })
    }

    /// Creates a connection over `transport` and starts its driver.
    pub fn attach(
        role: Role,
        crypto: &CryptoProvider,
        transport: TransportHandle,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let connection = Self::new(role, crypto, transport.sink, config);
        connection.spawn(transport.events);
        connection
    }

    /// Starts the driver task that feeds `events` to this connection.
    ///
    /// The task ends when the transport closes, its event stream ends or the
    /// connection is closed locally.
    pub fn spawn(self: &Arc<Self>, mut events: TransportEvents) -> JoinHandle<()> {
        let connection = Arc::clone(self);
        tokio::spawn(async move {
            let closed = connection.closed();
            tokio::pin!(closed);

            loop {
                tokio::select! {
                    _ = &mut closed => break,
                    event = events.recv() => match event {
                        Some(event) => connection.handle_event(event),
                        None => {
                            connection.handle_close("transport event stream ended");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Processes one transport notification.
    pub fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.handle_open(),
            TransportEvent::Message(message) => self.handle_message(message),
            TransportEvent::Close => self.handle_close("transport closed"),
        }
    }

    // Callbacks

    /// Sets the handler for inbound envelopes that do not complete a request.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(&Arc<Connection>, Envelope) + Send + Sync + 'static,
    {
        *lock(&self.on_message) = Some(Arc::new(callback));
    }

    /// Sets the handler fired once the handshake completes.
    ///
    /// Has no effect if the handshake already completed; use
    /// [`Connection::wait_ready`] in that case.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce(&Arc<Connection>) + Send + 'static,
    {
        *lock(&self.on_ready) = Some(Box::new(callback));
    }

    /// Sets the handler fired once the transport closes.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *lock(&self.on_disconnect) = Some(Box::new(callback));
    }

    /// Waits until the handshake completes.
    ///
    /// Fails with [`ProtocolError::ConnectionClosed`] if the connection closes
    /// first.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        let _ = state
            .wait_for(|s| *s != ConnectionState::Unauthenticated)
            .await;

        if self.cipher.get().is_some() {
            Ok(())
        } else {
            Err(ProtocolError::ConnectionClosed(
                "closed before handshake completed".to_string(),
            ))
        }
    }

    /// Waits until the connection is closed.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    // Accessors

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn role(&self) -> Role {
        self.handshake.role()
    }

    /// Hex-encoded public key this connection advertises.
    pub fn public_key(&self) -> &str {
        self.handshake.key_pair().public_key_hex()
    }

    pub fn fingerprint(&self) -> String {
        self.handshake.key_pair().fingerprint()
    }

    pub fn pending_requests(&self) -> &PendingRequests {
        &self.pending
    }

    // Outbound operations

    /// Sends a request and waits for the correlated reply or error.
    ///
    /// Request ids start at 0 and increase by one per call that is transmitted.
    pub async fn send(&self, endpoint: &str, payload: Value) -> Result<Envelope> {
        let cipher = self.ready_cipher()?;

        let (id, reply) = self.pending.register();
        // A close between the state check and registration would miss fail_all.
        if self.state() == ConnectionState::Closed {
            self.pending.cancel(id);
            return Err(ProtocolError::ConnectionClosed(
                "connection closed".to_string(),
            ));
        }

        let envelope = Envelope::request(id, endpoint, payload);
        if let Err(e) = self.transmit_sealed(cipher, &envelope) {
            self.pending.cancel(id);
            return Err(e);
        }
        tracing::trace!(id, endpoint, "request sent");

        let outcome = match self.config.request_timeout() {
            Some(limit) => match tokio::time::timeout(limit, reply).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.cancel(id);
                    return Err(ProtocolError::Timeout(format!(
                        "no reply to request {} after {:?}",
                        id, limit
                    )));
                }
            },
            None => reply.await,
        };

        outcome.map_err(|_| ProtocolError::ConnectionClosed("request abandoned".to_string()))?
    }

    /// Replies to the request with `id`. Success means transmitted, not received.
    pub async fn reply(&self, endpoint: &str, id: u64, payload: Value) -> Result<()> {
        let cipher = self.ready_cipher()?;
        self.transmit_sealed(cipher, &Envelope::reply(id, endpoint, payload))
    }

    /// Sends a notification that expects no response.
    pub async fn push(&self, endpoint: &str, payload: Value) -> Result<()> {
        let cipher = self.ready_cipher()?;
        self.transmit_sealed(cipher, &Envelope::push(endpoint, payload))
    }

    /// Sends an error, correlated with a request when `id` is given.
    pub async fn error(
        &self,
        endpoint: &str,
        id: Option<u64>,
        code: i64,
        payload: Option<Value>,
    ) -> Result<()> {
        let cipher = self.ready_cipher()?;
        self.transmit_sealed(cipher, &Envelope::error(id, endpoint, code, payload))
    }

    /// Closes the transport and the connection.
    pub fn close(&self) {
        self.sink.close();
        self.handle_close("closed locally");
    }

    fn ready_cipher(&self) -> Result<&SessionCipher> {
        match self.state() {
            ConnectionState::Unauthenticated => Err(ProtocolError::NotReady),
            ConnectionState::Closed => Err(ProtocolError::ConnectionClosed(
                "connection closed".to_string(),
            )),
            ConnectionState::Authenticated => self.cipher.get().ok_or(ProtocolError::NotReady),
        }
    }

    fn transmit_sealed(&self, cipher: &SessionCipher, envelope: &Envelope) -> Result<()> {
        let json = envelope.to_json()?;
        self.sink
            .send(WireMessage::Text(cipher.encrypt_to_hex(&json)))
    }

    // Inbound handling

    fn handle_open(&self) {
        if self.role() != Role::Initiator || self.state() != ConnectionState::Unauthenticated {
            return;
        }
        tracing::debug!(fingerprint = %self.fingerprint(), "transport open, sending handshake");
        self.send_plaintext(self.handshake.hello());
    }

    fn handle_message(self: &Arc<Self>, message: WireMessage) {
        match self.state() {
            ConnectionState::Closed => {}
            ConnectionState::Unauthenticated => self.handle_handshake(message),
            ConnectionState::Authenticated => {
                if let Err(e) = self.handle_envelope(message) {
                    self.fail(e);
                }
            }
        }
    }

    fn handle_handshake(self: &Arc<Self>, message: WireMessage) {
        let text = match message {
            WireMessage::Text(text) => text,
            WireMessage::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    tracing::warn!("ignoring binary message before handshake");
                    return;
                }
            },
        };

        match self.handshake.process(&text) {
            Ok(HandshakeStep::Established { cipher, reply }) => {
                if self.cipher.set(cipher).is_err() {
                    return;
                }
                if let Some(reply) = reply {
                    self.send_plaintext(Ok(reply));
                }
                self.authenticate();
            }
            Ok(HandshakeStep::Rejected { error, reply }) => {
                tracing::warn!(role = ?self.role(), %error, "rejecting peer handshake");
                self.send_plaintext(Ok(reply));
            }
            Ok(HandshakeStep::Restart { reply }) => {
                tracing::debug!(role = ?self.role(), "message before handshake, resending hello");
                self.send_plaintext(Ok(reply));
            }
            Ok(HandshakeStep::PeerRejected) => {
                tracing::warn!(role = ?self.role(), "peer rejected our handshake");
            }
            Err(e) => self.fail(e),
        }
    }

    fn authenticate(self: &Arc<Self>) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Unauthenticated {
                *state = ConnectionState::Authenticated;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        tracing::info!(role = ?self.role(), fingerprint = %self.fingerprint(), "handshake complete");
        let callback = lock(&self.on_ready).take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    fn handle_envelope(self: &Arc<Self>, message: WireMessage) -> Result<()> {
        let cipher = self.cipher.get().ok_or(ProtocolError::NotReady)?;

        let json = match message {
            WireMessage::Text(text) if text.starts_with(HANDSHAKE_TAG) => {
                tracing::debug!("ignoring handshake after authentication");
                return Ok(());
            }
            WireMessage::Text(text) => cipher.decrypt_hex(&text)?,
            WireMessage::Binary(bytes) => String::from_utf8(cipher.decrypt(&bytes)?)
                .map_err(|e| ProtocolError::Decryption(format!("plaintext is not utf-8: {}", e)))?,
        };
        let envelope = Envelope::from_json(&json)?;

        match self.pending.dispatch(envelope) {
            Dispatch::Resolved(id) => tracing::trace!(id, "request completed"),
            Dispatch::Unmatched(_) => {}
            Dispatch::Inbound(envelope) => {
                let callback = lock(&self.on_message).clone();
                match callback {
                    Some(callback) => callback(self, envelope),
                    None => tracing::debug!(
                        endpoint = %envelope.endpoint,
                        "no message handler, dropping envelope"
                    ),
                }
            }
        }
        Ok(())
    }

    fn send_plaintext(&self, message: Result<String>) {
        let result = message.and_then(|text| self.sink.send(WireMessage::Text(text)));
        if let Err(e) = result {
            tracing::debug!(error = %e, "failed to send handshake message");
        }
    }

    fn fail(&self, error: ProtocolError) {
        tracing::error!(role = ?self.role(), %error, "closing connection");
        self.sink.close();
        self.handle_close(&error.to_string());
    }

    fn handle_close(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Closed;
                true
            } else {
                false
            }
        });
        if !changed {
            return;
        }

        tracing::info!(role = ?self.role(), reason, "connection closed");
        if self.config.fail_pending_on_close {
            let failed = self
                .pending
                .fail_all(|| ProtocolError::ConnectionClosed(reason.to_string()));
            if failed > 0 {
                tracing::debug!(failed, "failed outstanding requests");
            }
        }

        // Ready can no longer fire.
        lock(&self.on_ready).take();
        let callback = lock(&self.on_disconnect).take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role())
            .field("state", &self.state())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
