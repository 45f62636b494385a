//! Contract between a [`crate::Connection`] and the transport carrying it.
//!
//! A transport delivers [`TransportEvent`]s on a channel and accepts outbound
//! messages through a [`TransportSink`]. The protocol assumes reliable,
//! in-order delivery per connection and nothing else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};

/// One opaque transport message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Length of the message body in bytes.
    pub fn len(&self) -> usize {
        match self {
            WireMessage::Text(text) => text.len(),
            WireMessage::Binary(bytes) => bytes.len(),
        }
    }

    /// Returns true if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Notification emitted by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is connected. Only initiators act on it.
    Open,
    /// One inbound message.
    Message(WireMessage),
    /// The transport is gone. Nothing follows.
    Close,
}

/// Outbound half of a transport.
///
/// Both operations must return without waiting on the network; implementations
/// queue the message for a writer task.
pub trait TransportSink: Send + Sync {
    /// Queues one message for transmission.
    fn send(&self, message: WireMessage) -> Result<()>;

    /// Starts closing the transport. Idempotent.
    fn close(&self);
}

/// Receiver of transport notifications.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// A connected transport: the sink plus its event stream.
pub struct TransportHandle {
    pub sink: Arc<dyn TransportSink>,
    pub events: TransportEvents,
}

impl TransportHandle {
    pub fn new(sink: Arc<dyn TransportSink>, events: TransportEvents) -> Self {
        Self { sink, events }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}

/// In-process transport end created by [`memory_pair`].
struct MemorySink {
    peer: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl TransportSink for MemorySink {
    fn send(&self, message: WireMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed(
                "memory transport closed".to_string(),
            ));
        }
        self.peer
            .send(TransportEvent::Message(message))
            .map_err(|_| ProtocolError::ConnectionClosed("peer dropped".to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.peer.send(TransportEvent::Close);
        }
    }
}

/// Creates two connected in-memory transports: `(initiator, acceptor)`.
///
/// The initiator's event stream starts with [`TransportEvent::Open`]. Closing
/// either side delivers [`TransportEvent::Close`] to the other; dropping one
/// side ends the other's event stream.
pub fn memory_pair() -> (TransportHandle, TransportHandle) {
    let (initiator_tx, initiator_rx) = mpsc::unbounded_channel();
    let (acceptor_tx, acceptor_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    // Receiver is alive, so this cannot fail.
    let _ = initiator_tx.send(TransportEvent::Open);

    let initiator = TransportHandle::new(
        Arc::new(MemorySink {
            peer: acceptor_tx,
            closed: closed.clone(),
        }),
        initiator_rx,
    );
    let acceptor = TransportHandle::new(
        Arc::new(MemorySink {
            peer: initiator_tx,
            closed,
        }),
        acceptor_rx,
    );

    (initiator, acceptor)
}
