//! WebSocket signaling server.
//!
//! Every accepted socket gets its own task running one gateway session.
//! Commands from one socket are handled strictly in order; sockets only
//! share the presence store and the broadcast hub.

use crate::config::ServerConfig;
use crate::connection::{ClientConnection, ConnectionHub};
use anyhow::Result;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async_with_config};
use tracing::{debug, error, info, warn};
use wisp_core::gateway::{GatewayOutput, SignalingGateway};
use wisp_core::presence::{PresenceRegistry, PresenceStore};
use wisp_core::protocol::SignalingReply;

/// WebSocket server hosting the signaling gateway.
pub struct SignalingServer {
    gateway: Arc<SignalingGateway>,
    hub: Arc<ConnectionHub>,
    max_message_size: usize,
    /// Counter for generating connection IDs
    next_conn_id: u64,
    sessions: JoinSet<()>,
}

impl SignalingServer {
    /// Create a server backed by the given presence store.
    pub fn new(config: &ServerConfig, store: Arc<dyn PresenceStore>) -> Self {
        Self {
            gateway: Arc::new(SignalingGateway::new(store, config.sample_size)),
            hub: Arc::new(ConnectionHub::new()),
            max_message_size: config.max_message_size,
            next_conn_id: 1,
            sessions: JoinSet::new(),
        }
    }

    /// Create a server with an in-memory presence registry.
    pub fn in_memory(config: &ServerConfig) -> Self {
        Self::new(config, Arc::new(PresenceRegistry::new()))
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Signaling server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Number of open signaling sockets.
    pub fn connection_count(&self) -> usize {
        self.hub.len()
    }

    /// Hand a new TCP connection to its own session task.
    pub fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        // Reap finished sessions
        while self.sessions.try_join_next().is_some() {}

        let conn_id = format!("conn-{}", self.next_conn_id);
        self.next_conn_id += 1;

        let session = Session {
            conn_id,
            gateway: self.gateway.clone(),
            hub: self.hub.clone(),
            max_message_size: self.max_message_size,
        };
        self.sessions.spawn(async move {
            session.run(stream, addr).await;
        });
    }

    /// Accept connections until the listener fails.
    pub async fn serve(mut self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => self.accept_connection(stream, addr),
                Err(e) => error!("Failed to accept connection: {}", e),
            }
        }
    }

    /// Close every socket and stop all session tasks.
    pub async fn shutdown(&mut self) {
        info!("Shutting down, closing {} connections", self.hub.len());
        self.hub.close_all().await;
        self.sessions.shutdown().await;
    }
}

/// Protocol-level frame cap as a multiple of `max_message_size`.
///
/// Frames up to `max_message_size` are handled, frames above it up to the
/// cap get an error reply, and anything larger fails the read and closes the
/// socket without being buffered in full.
pub const HARD_LIMIT_FACTOR: usize = 4;

fn ws_config(max_message_size: usize) -> WebSocketConfig {
    let hard_limit = max_message_size.saturating_mul(HARD_LIMIT_FACTOR);
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(hard_limit);
    config.max_frame_size = Some(hard_limit);
    config
}

/// One socket's session task.
struct Session {
    conn_id: String,
    gateway: Arc<SignalingGateway>,
    hub: Arc<ConnectionHub>,
    max_message_size: usize,
}

impl Session {
    async fn run(self, stream: TcpStream, addr: SocketAddr) {
        let ws_config = ws_config(self.max_message_size);
        let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
            Ok(ws) => ws,
            Err(e) => {
                // Health checks connect and close without completing the
                // WebSocket handshake
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        info!("New connection from {} (conn_id: {})", addr, self.conn_id);
        self.drive(ws_stream).await;
        info!("Connection {} closed", self.conn_id);
    }

    async fn drive(&self, ws_stream: WebSocketStream<TcpStream>) {
        let (write, mut read) = ws_stream.split();
        let conn = Arc::new(ClientConnection::new(self.conn_id.clone(), write));

        // Registered before connect so the new socket sees its own count
        self.hub.insert(conn.clone());

        let mut session = match self.gateway.connect(self.conn_id.as_str()).await {
            Ok((session, output)) => {
                self.deliver(&conn, output).await;
                session
            }
            Err(e) => {
                error!("Failed to register {}: {}", self.conn_id, e);
                self.hub.remove(&self.conn_id);
                conn.close().await;
                return;
            }
        };

        loop {
            let data = match read.next().await {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => text.as_bytes().to_vec(),
                    Message::Binary(data) => data.to_vec(),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                    Message::Close(_) => {
                        debug!("Received close frame from {}", self.conn_id);
                        break;
                    }
                },
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection {} closed", self.conn_id);
                        }
                        _ => {
                            warn!("WebSocket error on {}: {}", self.conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection {} stream ended", self.conn_id);
                    break;
                }
            };

            if data.len() > self.max_message_size {
                warn!(
                    "Message from {} exceeds max size ({} > {}), dropping",
                    self.conn_id,
                    data.len(),
                    self.max_message_size
                );
                let reply = SignalingReply::error(format!(
                    "message too large: {} > {} bytes",
                    data.len(),
                    self.max_message_size
                ));
                self.send(&conn, &reply).await;
                continue;
            }

            let output = self.gateway.handle_frame(&mut session, &data).await;
            self.deliver(&conn, output).await;
        }

        self.hub.remove(&self.conn_id);
        match self.gateway.disconnect(&mut session).await {
            Ok(output) => self.deliver(&conn, output).await,
            Err(e) => error!("Failed to unregister {}: {}", self.conn_id, e),
        }
    }

    /// Route a gateway step's output: the reply to this socket, the
    /// broadcast to every socket still in the hub.
    async fn deliver(&self, conn: &ClientConnection, output: GatewayOutput) {
        if let Some(reply) = output.reply {
            self.send(conn, &reply).await;
        }
        if let Some(broadcast) = output.broadcast {
            self.hub.broadcast(&broadcast.to_json()).await;
        }
    }

    async fn send(&self, conn: &ClientConnection, reply: &SignalingReply) {
        if let Err(e) = conn.send_text(reply.to_json()).await {
            warn!("Failed to reply to {}: {}", self.conn_id, e);
        }
    }
}
