//! WebSocket server the browser agent connects to.
//!
//! At most one agent is served at a time. A second connection is closed with
//! a policy frame while the first stays up. Callers only see `ServerEvent`s
//! for the active agent via `poll_event()`.

use crate::connection::{AgentConnection, ConnectionEvent};
use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, error, info, warn};

/// Close reason sent to connections refused because an agent is active.
pub const AGENT_BUSY: &str = "another agent is already connected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    AgentConnected { address: String },
    /// A frame from the active agent.
    Message(Vec<u8>),
    AgentDisconnected,
}

pub struct WebSocketServer {
    agent: Option<AgentConnection>,
    next_conn_id: u64,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Default for WebSocketServer {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            agent: None,
            next_conn_id: 1,
            event_tx,
            event_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Waiting for the agent on ws://{}", listener.local_addr()?);
        Ok(listener)
    }

    /// Upgrade an incoming TCP connection. It becomes the active agent unless
    /// one is already connected, in which case it is closed right away.
    pub async fn accept_connection(&mut self, stream: TcpStream, addr: SocketAddr) {
        let mut ws_stream = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                // Port scanners connect and close without finishing the upgrade.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before upgrade from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        if self.agent.is_some() {
            warn!(
                "Refusing connection from {} (conn-{}): {}",
                addr, conn_id, AGENT_BUSY
            );
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: AGENT_BUSY.into(),
            };
            if let Err(e) = ws_stream.close(Some(frame)).await {
                debug!("Close of refused conn-{} failed: {}", conn_id, e);
            }
            return;
        }

        info!("Agent connected from {} (conn-{})", addr, conn_id);

        // Queue the open event before the read task can queue messages.
        let _ = self.event_tx.send(ConnectionEvent::Opened {
            conn_id,
            address: addr.to_string(),
        });
        self.agent = Some(AgentConnection::new(
            conn_id,
            ws_stream,
            self.event_tx.clone(),
        ));
    }

    /// Wait for the next event from the active agent. Events from
    /// connections that are no longer active are discarded.
    pub async fn poll_event(&mut self) -> Option<ServerEvent> {
        loop {
            let event = self.event_rx.recv().await?;

            match event {
                ConnectionEvent::Opened { conn_id, address } => {
                    if self.is_active(conn_id) {
                        return Some(ServerEvent::AgentConnected { address });
                    }
                }
                ConnectionEvent::Message { conn_id, data } => {
                    if self.is_active(conn_id) {
                        return Some(ServerEvent::Message(data));
                    }
                    debug!("Dropping frame from stale conn-{}", conn_id);
                }
                ConnectionEvent::Closed { conn_id } => {
                    if self.is_active(conn_id) {
                        info!("Agent disconnected (conn-{})", conn_id);
                        self.agent = None;
                        return Some(ServerEvent::AgentDisconnected);
                    }
                }
            }
        }
    }

    /// Send a text frame to the active agent.
    pub async fn send(&self, frame: &str) -> Result<()> {
        let agent = self
            .agent
            .as_ref()
            .ok_or_else(|| anyhow!("No agent connected"))?;
        agent.send_text(frame).await
    }

    pub fn is_connected(&self) -> bool {
        self.agent.is_some()
    }

    /// Close the active agent's connection, if any.
    pub async fn disconnect(&mut self) {
        if let Some(mut agent) = self.agent.take() {
            agent.close().await;
        }
    }

    fn is_active(&self, conn_id: u64) -> bool {
        self.agent
            .as_ref()
            .is_some_and(|agent| agent.conn_id == conn_id)
    }
}
