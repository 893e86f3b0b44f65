//! The WebSocket connection to the browser agent.
//!
//! The stream is split so the read half runs in its own task while the
//! daemon writes through the shared sink.

use anyhow::{anyhow, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use scriptsync_core::MAX_MESSAGE_SIZE;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    Opened { conn_id: u64, address: String },
    Message { conn_id: u64, data: Vec<u8> },
    Closed { conn_id: u64 },
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

pub struct AgentConnection {
    pub conn_id: u64,
    write: Arc<Mutex<WsSink>>,
    read_task: Option<JoinHandle<()>>,
}

impl AgentConnection {
    /// Wrap an upgraded stream and start forwarding its frames.
    pub fn new(
        conn_id: u64,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));

        let read_task = tokio::spawn(async move {
            Self::read_loop(conn_id, read, event_tx).await;
        });

        Self {
            conn_id,
            write,
            read_task: Some(read_task),
        }
    }

    async fn read_loop(
        conn_id: u64,
        mut read: SplitStream<WebSocketStream<TcpStream>>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        loop {
            match read.next().await {
                Some(Ok(msg)) => {
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(data) => data,
                        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                        Message::Close(_) => {
                            debug!("Received close frame on conn-{}", conn_id);
                            break;
                        }
                    };

                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!(
                            "Message on conn-{} exceeds max size ({} > {}), dropping",
                            conn_id,
                            data.len(),
                            MAX_MESSAGE_SIZE
                        );
                        continue;
                    }

                    debug!("Message on conn-{}: {} bytes", conn_id, data.len());
                    if event_tx
                        .send(ConnectionEvent::Message { conn_id, data })
                        .is_err()
                    {
                        return;
                    }
                }
                Some(Err(e)) => {
                    match e {
                        WsError::ConnectionClosed | WsError::AlreadyClosed => {
                            debug!("Connection conn-{} closed", conn_id);
                        }
                        _ => {
                            error!("WebSocket error on conn-{}: {}", conn_id, e);
                        }
                    }
                    break;
                }
                None => {
                    debug!("Connection conn-{} stream ended", conn_id);
                    break;
                }
            }
        }

        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send one JSON envelope as a text frame.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|e| anyhow!("Failed to send message: {}", e))
    }

    pub async fn close(&mut self) {
        if let Ok(mut write) = self.write.try_lock() {
            let _ = write.send(Message::Close(None)).await;
        }

        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}

impl Drop for AgentConnection {
    fn drop(&mut self) {
        if let Some(task) = self.read_task.take() {
            task.abort();
        }
    }
}
