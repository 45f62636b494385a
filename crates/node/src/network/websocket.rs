//! WebSocket transport for IonNet connections.
//!
//! Each socket is split into a reader task, which turns frames into
//! [`TransportEvent`]s, and a writer task fed by a [`TransportSink`]. Only
//! plain `ws://` is spoken.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use ionnet_protocol::error::{ProtocolError, Result};
use ionnet_protocol::{ListenerEvent, TransportEvent, TransportHandle, TransportSink, WireMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async, connect_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};

/// Instruction for a socket's writer task.
enum Outgoing {
    Message(WireMessage),
    Close,
}

/// Outbound half of a WebSocket, backed by the writer task's queue.
struct WebSocketSink {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: AtomicBool,
}

impl TransportSink for WebSocketSink {
    fn send(&self, message: WireMessage) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::ConnectionClosed(
                "WebSocket closed".to_string(),
            ));
        }
        self.outgoing
            .send(Outgoing::Message(message))
            .map_err(|_| ProtocolError::ConnectionClosed("WebSocket writer stopped".to_string()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

/// Wraps an established WebSocket as a transport.
///
/// With `open` set, the event stream starts with [`TransportEvent::Open`].
pub fn wrap<S>(socket: WebSocketStream<S>, open: bool) -> TransportHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    if open {
        let _ = event_tx.send(TransportEvent::Open);
    }

    // Writer: drains the sink queue until closed or the socket fails
    tokio::spawn(async move {
        while let Some(outgoing) = outgoing_rx.recv().await {
            let frame = match outgoing {
                Outgoing::Message(WireMessage::Text(text)) => WsMessage::Text(text),
                Outgoing::Message(WireMessage::Binary(bytes)) => WsMessage::Binary(bytes),
                Outgoing::Close => break,
            };
            if let Err(e) = ws_sink.send(frame).await {
                tracing::debug!("failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    // Reader: forwards frames until the socket closes
    tokio::spawn(async move {
        while let Some(result) = ws_stream.next().await {
            let event = match result {
                Ok(WsMessage::Text(text)) => TransportEvent::Message(WireMessage::Text(text)),
                Ok(WsMessage::Binary(bytes)) => TransportEvent::Message(WireMessage::Binary(bytes)),
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
                Err(e) => {
                    tracing::debug!("WebSocket error: {}", e);
                    break;
                }
            };
            if event_tx.send(event).is_err() {
                break;
            }
        }
        let _ = event_tx.send(TransportEvent::Close);
    });

    TransportHandle::new(
        Arc::new(WebSocketSink {
            outgoing: outgoing_tx,
            closed: AtomicBool::new(false),
        }),
        event_rx,
    )
}

/// Opens a client WebSocket to `url`, returning an initiator transport.
pub async fn connect(url: &str) -> Result<TransportHandle> {
    tracing::info!("Connecting to {}", url);

    let (socket, _) = connect_async(url).await.map_err(|e| match e {
        WsError::Io(io_err) => ProtocolError::from(io_err),
        _ => ProtocolError::Transport(format!("WebSocket connection failed: {}", e)),
    })?;

    Ok(wrap(socket, true))
}

/// Accepts WebSocket clients on a TCP port.
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    /// Binds to `addr`.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// The bound address, useful after binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Starts accepting in the background.
    ///
    /// The returned stream yields [`ListenerEvent::Listening`] first, then one
    /// [`ListenerEvent::Connection`] per client whose WebSocket upgrade
    /// succeeded. Dropping the receiver stops the accept loop.
    pub fn serve(self) -> mpsc::UnboundedReceiver<ListenerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if tx.send(ListenerEvent::Listening).is_err() {
                return;
            }

            loop {
                let (stream, peer) = tokio::select! {
                    _ = tx.closed() => break,
                    accepted = self.listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("failed to accept TCP connection: {}", e);
                            continue;
                        }
                    },
                };

                let tx = tx.clone();
                tokio::spawn(async move {
                    match accept_async(stream).await {
                        Ok(socket) => {
                            tracing::debug!(%peer, "WebSocket client connected");
                            let _ = tx.send(ListenerEvent::Connection(wrap(socket, false)));
                        }
                        Err(e) => tracing::warn!(%peer, "WebSocket upgrade failed: {}", e),
                    }
                });
            }
            tracing::debug!("WebSocket listener stopped");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = WebSocketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_serve_reports_listening_first() {
        let listener = WebSocketListener::bind("127.0.0.1:0").await.unwrap();
        let mut events = listener.serve();
        assert!(matches!(events.recv().await, Some(ListenerEvent::Listening)));
    }

    #[tokio::test]
    async fn test_frames_cross_the_socket() {
        let listener = WebSocketListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut events = listener.serve();
        let _ = events.recv().await;

        let mut client = connect(&format!("ws://{}", addr)).await.unwrap();
        let mut server = match events.recv().await {
            Some(ListenerEvent::Connection(handle)) => handle,
            other => panic!("expected connection, got {:?}", other),
        };

        assert_eq!(client.events.recv().await, Some(TransportEvent::Open));

        client.sink.send(WireMessage::Text("hello".into())).unwrap();
        assert_eq!(
            server.events.recv().await,
            Some(TransportEvent::Message(WireMessage::Text("hello".into())))
        );

        server.sink.send(WireMessage::Binary(vec![7, 8, 9])).unwrap();
        assert_eq!(
            client.events.recv().await,
            Some(TransportEvent::Message(WireMessage::Binary(vec![7, 8, 9])))
        );

        client.sink.close();
        assert_eq!(server.events.recv().await, Some(TransportEvent::Close));
        assert!(client.sink.send(WireMessage::Text("late".into())).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port nobody listens on
        let addr = {
            let listener = WebSocketListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        assert!(connect(&format!("ws://{}", addr)).await.is_err());
    }
}
