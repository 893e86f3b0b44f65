//! The daemon's event loop: one `select!` feeding the engine.

use crate::config::Config;
use crate::host::HeadlessHost;
use crate::native_fs::NativeFs;
use crate::server::{ServerEvent, WebSocketServer};
use crate::watcher::{FileEvent, FileEventKind, FileWatcher};
use anyhow::Result;
use scriptsync_core::fs::FileSystem;
use scriptsync_core::{EngineEvent, Subscription, SyncEngine};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

pub struct Daemon {
    engine: SyncEngine<Arc<NativeFs>>,
    server: WebSocketServer,
    watcher: FileWatcher,
    /// Logs engine events for as long as the daemon lives
    _event_log: Subscription,
}

fn log_event(event: &EngineEvent) {
    let json = serde_json::to_string(event).unwrap_or_default();
    match event {
        EngineEvent::ErrorSurfaced { .. } | EngineEvent::WriteDropped { .. } => {
            warn!(event = %json, "engine event")
        }
        _ => debug!(event = %json, "engine event"),
    }
}

/// Sleep until the engine's next deadline, or forever without one.
async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

impl Daemon {
    pub fn new(workspace: PathBuf, config: &Config) -> Result<Self> {
        let fs = Arc::new(NativeFs::new(workspace.clone()));
        let host = HeadlessHost::new(Arc::clone(&fs));
        let engine = SyncEngine::new(fs, host, config.engine_config());

        let event_log = engine.events().subscribe(log_event);

        let watcher = FileWatcher::new(workspace)?;
        info!("Watching {:?}", watcher.workspace_path());

        Ok(Self {
            engine,
            server: WebSocketServer::new(),
            watcher,
            _event_log: event_log,
        })
    }

    pub fn engine(&self) -> &SyncEngine<Arc<NativeFs>> {
        &self.engine
    }

    /// Run until `shutdown` resolves, then fail whatever is still pending.
    pub async fn run(mut self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);

        loop {
            let deadline = self.engine.next_deadline();
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            self.server.accept_connection(stream, addr).await;
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }

                Some(event) = self.watcher.event_rx().recv() => {
                    self.on_file_event(event).await;
                }

                Some(event) = self.server.poll_event() => {
                    self.on_server_event(event).await;
                }

                _ = sleep_until(deadline) => {
                    if let Err(e) = self.engine.on_timer(Instant::now()).await {
                        error!("Timer processing failed: {}", e);
                    }
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }

            self.flush_outbox().await;
        }

        let failed = self.engine.stop(Instant::now()).await;
        if failed > 0 {
            warn!("Failed {} pending operation(s) on shutdown", failed);
        }
        self.server.disconnect().await;
        Ok(())
    }

    async fn on_file_event(&mut self, event: FileEvent) {
        let now = Instant::now();
        let result = match event.kind {
            FileEventKind::Modified => {
                let content = match self.engine.fs().read_string_opt(&event.path).await {
                    Ok(Some(content)) => content,
                    Ok(None) => return,
                    Err(e) => {
                        debug!("Skipping {}: {}", event.path, e);
                        return;
                    }
                };
                self.engine.on_file_changed(&event.path, content, now).await
            }
            FileEventKind::Deleted => {
                self.engine.on_file_deleted(&event.path, now);
                Ok(())
            }
            FileEventKind::Renamed { from } => {
                self.engine.on_file_renamed(&from, &event.path, now).await
            }
        };
        if let Err(e) = result {
            error!("Failed to process change to {}: {}", event.path, e);
        }
    }

    async fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AgentConnected { address } => {
                debug!("Agent address: {}", address);
                self.engine.on_agent_connected();
            }
            ServerEvent::Message(data) => {
                if let Err(e) = self.engine.on_agent_message(&data, Instant::now()).await {
                    error!("Failed to process agent message: {}", e);
                }
            }
            ServerEvent::AgentDisconnected => {
                self.engine.on_agent_disconnected(Instant::now()).await;
            }
        }
    }

    /// Move queued frames onto the socket.
    async fn flush_outbox(&mut self) {
        for frame in self.engine.drain_outbox() {
            if let Err(e) = self.server.send(&frame).await {
                warn!("Dropping outbound frame: {}", e);
            }
        }
    }
}
