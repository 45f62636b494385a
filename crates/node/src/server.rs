//! IonNet echo server.
//!
//! The [`Server`] binds a WebSocket listener, turns every client into an
//! acceptor [`Connection`] and answers each request with a reply carrying the
//! same endpoint and payload. Live connections are tracked by a per-connection
//! uuid until they disconnect.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use dashmap::DashMap;
use ionnet_protocol::{
    Connection, CryptoProvider, Envelope, Listener, MessageKind, DEFAULT_ERROR_CODE,
};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::network::WebSocketListener;

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the server.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// Server state changed.
    StateChanged(ServerState),
    /// A peer completed the handshake.
    PeerConnected { id: Uuid, fingerprint: String },
    /// A peer went away.
    PeerDisconnected { id: Uuid },
}

/// Echo server over WebSockets.
pub struct Server {
    config: Config,
    crypto: Arc<CryptoProvider>,
    state: Arc<RwLock<ServerState>>,
    connections: Arc<DashMap<Uuid, Arc<Connection>>>,
    local_addr: Option<SocketAddr>,
    shutdown_token: CancellationToken,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Creates a server using `crypto` for every connection it accepts.
    pub fn new(config: Config, crypto: Arc<CryptoProvider>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            crypto,
            state: Arc::new(RwLock::new(ServerState::Stopped)),
            connections: Arc::new(DashMap::new()),
            local_addr: None,
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> ServerState {
        *self.state.read().await
    }

    /// Returns a receiver for server events.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// The bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Binds the listener and starts accepting.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let listen_addr = self.config.network.listen_socket_addr()?;
        {
            let mut state = self.state.write().await;
            if *state != ServerState::Stopped {
                anyhow::bail!("Server is already running");
            }
            *state = ServerState::Starting;
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::Starting));

        let bound = match WebSocketListener::bind(listen_addr).await {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.write().await = ServerState::Stopped;
                return Err(e).with_context(|| format!("Failed to bind {}", listen_addr));
            }
        };
        let local_addr = bound.local_addr()?;
        self.local_addr = Some(local_addr);

        let listener = Listener::new(Arc::clone(&self.crypto), self.config.protocol.clone());
        listener.on_ready(move || info!("Listening on ws://{}", local_addr));

        let connections = Arc::clone(&self.connections);
        let event_tx = self.event_tx.clone();
        listener.on_connection(move |conn| {
            Self::track(&connections, &event_tx, conn);
        });

        let events = bound.serve();
        // A token cancelled by an earlier stop would end this loop at once
        self.shutdown_token = CancellationToken::new();
        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    debug!("Accept loop received shutdown signal");
                }
                _ = listener.run(events) => {
                    warn!("Listener stopped unexpectedly");
                }
            }
        });

        *self.state.write().await = ServerState::Running;
        self.emit_event(ServerEvent::StateChanged(ServerState::Running));
        Ok(local_addr)
    }

    /// Stops accepting and closes every live connection.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match *state {
                ServerState::Stopped => return Ok(()),
                ServerState::ShuttingDown => anyhow::bail!("Server is already shutting down"),
                _ => *state = ServerState::ShuttingDown,
            }
        }
        self.emit_event(ServerEvent::StateChanged(ServerState::ShuttingDown));

        info!("Stopping server...");
        self.shutdown_token.cancel();

        // Collect first: closing fires on_disconnect, which removes from the map
        let live: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for conn in live {
            conn.close();
        }
        self.connections.clear();

        *self.state.write().await = ServerState::Stopped;
        self.emit_event(ServerEvent::StateChanged(ServerState::Stopped));
        info!("Server stopped");
        Ok(())
    }

    fn track(
        connections: &Arc<DashMap<Uuid, Arc<Connection>>>,
        event_tx: &broadcast::Sender<ServerEvent>,
        conn: Arc<Connection>,
    ) {
        let id = Uuid::new_v4();
        connections.insert(id, Arc::clone(&conn));

        conn.on_message(echo);

        let ready_tx = event_tx.clone();
        conn.on_ready(move |conn| {
            let fingerprint = conn.fingerprint();
            info!(%id, "Peer connected");
            let _ = ready_tx.send(ServerEvent::PeerConnected { id, fingerprint });
        });

        let connections = Arc::clone(connections);
        let closed_tx = event_tx.clone();
        conn.on_disconnect(move || {
            connections.remove(&id);
            info!(%id, "Peer disconnected");
            let _ = closed_tx.send(ServerEvent::PeerDisconnected { id });
        });
    }

    fn emit_event(&self, event: ServerEvent) {
        let _ = self.event_tx.send(event);
    }
}

/// Answers a request with its own endpoint and payload.
///
/// Notifications and uncorrelated errors are only logged.
pub fn echo(conn: &Arc<Connection>, envelope: Envelope) {
    match envelope.kind {
        MessageKind::Send => {
            let conn = Arc::clone(conn);
            tokio::spawn(async move {
                let result = match envelope.id {
                    Some(id) => {
                        conn.reply(&envelope.endpoint, id, envelope.payload.unwrap_or(Value::Null))
                            .await
                    }
                    None => {
                        conn.error(&envelope.endpoint, None, DEFAULT_ERROR_CODE, None)
                            .await
                    }
                };
                if let Err(e) = result {
                    warn!("Failed to answer {}: {}", envelope.endpoint, e);
                }
            });
        }
        MessageKind::Push | MessageKind::Util => {
            info!(endpoint = %envelope.endpoint, payload = ?envelope.payload, "Notification received");
        }
        MessageKind::Error => {
            warn!(endpoint = %envelope.endpoint, code = ?envelope.code, "Peer reported an error");
        }
        MessageKind::Reply => {
            debug!(endpoint = %envelope.endpoint, "Ignoring uncorrelated reply");
        }
    }
}
