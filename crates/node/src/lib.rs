//! # IonNet Node Library
//!
//! Runs the IonNet protocol over WebSockets: an echo server, one-shot client
//! operations and the configuration both share.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐          ┌──────────────────────────┐
//! │   client::call / push    │          │     Server (echo)        │
//! ├──────────────────────────┤          ├──────────────────────────┤
//! │ Connection (initiator)   │          │ Listener → Connection    │
//! │                          │          │          (acceptor)      │
//! ├──────────────────────────┤          ├──────────────────────────┤
//! │ network::connect         │ ──ws──▶ │ WebSocketListener        │
//! └──────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use ionnet_node::{client, Config, Server};
//! use ionnet_protocol::CryptoProvider;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let crypto = Arc::new(CryptoProvider::new());
//!
//!     let mut server = Server::new(config.clone(), crypto.clone());
//!     let addr = server.start().await?;
//!
//!     let url = format!("ws://{}", addr);
//!     let reply = client::call(&url, "echo", json!({"x": 1}), &crypto, &config.protocol).await?;
//!     println!("{:?}", reply.payload);
//!
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`network`]: WebSocket transport
//! - [`server`]: Echo server and connection tracking
//! - [`client`]: One-shot requests and notifications

pub mod client;
pub mod config;
pub mod network;
pub mod server;

// Re-export protocol for convenience
pub use ionnet_protocol;

pub use config::{Config, ConfigError};
pub use network::{connect, WebSocketListener};
pub use server::{echo, Server, ServerEvent, ServerState};
