//! One-shot client operations against an IonNet server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ionnet_protocol::{Connection, ConnectionConfig, CryptoProvider, Envelope, Role};
use serde_json::Value;

use crate::network;

/// How long to wait for the server's half of the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connects to `url` and waits until the handshake completes.
pub async fn connect(
    url: &str,
    crypto: &CryptoProvider,
    config: &ConnectionConfig,
) -> Result<Arc<Connection>> {
    let transport = network::connect(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let conn = Connection::attach(Role::Initiator, crypto, transport, config.clone());

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, conn.wait_ready()).await {
        Ok(Ok(())) => Ok(conn),
        Ok(Err(e)) => Err(e).context("Handshake failed"),
        Err(_) => {
            conn.close();
            anyhow::bail!("Handshake with {} timed out after {:?}", url, HANDSHAKE_TIMEOUT)
        }
    }
}

/// Sends one request and returns the correlated reply or error envelope.
pub async fn call(
    url: &str,
    endpoint: &str,
    payload: Value,
    crypto: &CryptoProvider,
    config: &ConnectionConfig,
) -> Result<Envelope> {
    let conn = connect(url, crypto, config).await?;
    let outcome = conn.send(endpoint, payload).await;
    conn.close();
    outcome.with_context(|| format!("Request to {} failed", endpoint))
}

/// Sends one notification.
pub async fn push(
    url: &str,
    endpoint: &str,
    payload: Value,
    crypto: &CryptoProvider,
    config: &ConnectionConfig,
) -> Result<()> {
    let conn = connect(url, crypto, config).await?;
    // The close frame is queued behind the push, so it is not lost
    let outcome = conn.push(endpoint, payload).await;
    conn.close();
    outcome.with_context(|| format!("Push to {} failed", endpoint))
}
