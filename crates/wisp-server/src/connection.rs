//! Signaling client connections and the hub used for broadcasts.
//!
//! Each connection's write half is shared behind a mutex so that replies
//! from its own task and broadcasts from other tasks never interleave
//! within a frame.

use anyhow::{Result, anyhow};
use futures::SinkExt;
use futures::stream::SplitSink;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write side of one signaling socket.
pub struct ClientConnection {
    /// Connection id, e.g. "conn-1"; also the presence key
    pub conn_id: String,
    write: Mutex<WsSink>,
}

impl ClientConnection {
    pub fn new(conn_id: String, write: WsSink) -> Self {
        Self {
            conn_id,
            write: Mutex::new(write),
        }
    }

    /// Send a JSON text frame.
    pub async fn send_text(&self, text: String) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut write = self.write.lock().await;
        if let Err(e) = write.send(Message::Close(None)).await {
            debug!("Close frame to {} not sent: {}", self.conn_id, e);
        }
    }
}

/// All open signaling connections.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, conn: Arc<ClientConnection>) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(conn.conn_id.clone(), conn);
    }

    pub fn remove(&self, conn_id: &str) -> Option<Arc<ClientConnection>> {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(conn_id)
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current connections; the lock is not held while sending.
    pub fn snapshot(&self) -> Vec<Arc<ClientConnection>> {
        self.connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Send a text frame to every connection.
    pub async fn broadcast(&self, text: &str) {
        for conn in self.snapshot() {
            if let Err(e) = conn.send_text(text.to_string()).await {
                warn!("Failed to broadcast to {}: {}", conn.conn_id, e);
            }
        }
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        for conn in self.snapshot() {
            conn.close().await;
        }
    }
}
