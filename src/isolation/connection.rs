//! Connection value type and the transport seam it sends through

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error returned by a transport when a frame cannot be written
#[derive(Debug, Clone, Error)]
#[error("transport send failed: {0}")]
pub struct TransportError(pub String);

/// Send side of a live socket.
///
/// Handshake, framing and reconnection belong to the WebSocket layer; the
/// isolation subsystem only needs to know whether the socket is open and how
/// to hand it a message.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;

    async fn send(&self, message: &Value) -> Result<(), TransportError>;
}

/// In-process transport backed by the writer task's mpsc channel
pub struct ChannelTransport {
    sender: mpsc::Sender<Value>,
}

impl ChannelTransport {
    pub fn new(sender: mpsc::Sender<Value>) -> Self {
        Self { sender }
    }

    /// Create a transport together with the receiver a writer task would drain
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }

    async fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.sender
            .send(message.clone())
            .await
            .map_err(|e| TransportError(e.to_string()))
    }
}

/// One live socket owned by an isolated manager
#[derive(Clone)]
pub struct Connection {
    connection_id: String,
    user_id: String,
    transport: Arc<dyn Transport>,
    connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            transport,
            connected_at: Utc::now(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub async fn send(&self, message: &Value) -> Result<(), TransportError> {
        self.transport.send(message).await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("connection_id", &self.connection_id)
            .field("user_id", &self.user_id)
            .field("open", &self.is_open())
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::channel(4);
        let conn = Connection::new("c1", "u1", Arc::new(transport));

        assert!(conn.is_open());
        conn.send(&json!({"type": "x"})).await.unwrap();
        assert_eq!(rx.recv().await.unwrap()["type"], "x");
    }

    #[tokio::test]
    async fn test_channel_transport_closed_after_receiver_drop() {
        let (transport, rx) = ChannelTransport::channel(4);
        let conn = Connection::new("c1", "u1", Arc::new(transport));
        drop(rx);

        assert!(!conn.is_open());
        assert!(conn.send(&json!({"type": "x"})).await.is_err());
    }
}
