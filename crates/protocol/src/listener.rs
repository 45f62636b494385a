//! Wraps a listening transport so every inbound peer becomes an acceptor
//! [`Connection`].

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::crypto::CryptoProvider;
use crate::handshake::Role;
use crate::transport::TransportHandle;

/// Notification emitted by a listening transport.
#[derive(Debug)]
pub enum ListenerEvent {
    /// The listener is bound and accepting.
    Listening,
    /// A peer connected.
    Connection(TransportHandle),
}

type ConnectionCallback = Arc<dyn Fn(Arc<Connection>) + Send + Sync>;
type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Turns listener events into acceptor connections.
pub struct Listener {
    crypto: Arc<CryptoProvider>,
    config: ConnectionConfig,
    on_connection: Mutex<Option<ConnectionCallback>>,
    on_ready: Mutex<Option<ReadyCallback>>,
}

impl Listener {
    pub fn new(crypto: Arc<CryptoProvider>, config: ConnectionConfig) -> Self {
        Self {
            crypto,
            config,
            on_connection: Mutex::new(None),
            on_ready: Mutex::new(None),
        }
    }

    /// Sets the handler receiving each new connection.
    ///
    /// The handler runs before the connection processes any transport event,
    /// so callbacks it registers on the connection observe the handshake.
    pub fn on_connection<F>(&self, callback: F)
    where
        F: Fn(Arc<Connection>) + Send + Sync + 'static,
    {
        *self
            .on_connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Sets the handler fired once the listener is bound.
    pub fn on_ready<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_ready.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    /// Processes one listener event, returning the connection it created.
    pub fn handle_event(&self, event: ListenerEvent) -> Option<Arc<Connection>> {
        match event {
            ListenerEvent::Listening => {
                tracing::info!("listener ready");
                let callback = self
                    .on_ready
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(callback) = callback {
                    callback();
                }
                None
            }
            ListenerEvent::Connection(transport) => {
                let connection = Connection::new(
                    Role::Acceptor,
                    &self.crypto,
                    transport.sink,
                    self.config.clone(),
                );
                tracing::debug!(fingerprint = %connection.fingerprint(), "accepted connection");

                let callback = self
                    .on_connection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(callback) = callback {
                    callback(connection.clone());
                }

                connection.spawn(transport.events);
                Some(connection)
            }
        }
    }

    /// Processes events until the listener's stream ends.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ListenerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        tracing::debug!("listener event stream ended");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
