//! Network transports for IonNet connections.
//!
//! The protocol crate only needs a [`ionnet_protocol::TransportHandle`] per
//! peer. This module produces them from WebSockets, the transport IonNet
//! peers speak.

pub mod websocket;

pub use websocket::{connect, wrap, WebSocketListener};
