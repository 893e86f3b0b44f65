//! scriptsync: keeps a local script workspace in sync with remote records.
//!
//! The browser agent connects over WebSocket; file changes in the workspace
//! are saved through it and records it pushes are written to disk.

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scriptsync_daemon::{Args, Config, Daemon, WebSocketServer};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,scriptsync_daemon=debug,scriptsync_core=debug"
    } else {
        "info,scriptsync_daemon=info,scriptsync_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let Some(workspace) = args.workspace.clone().filter(|path| path.is_dir()) else {
        warn!("No workspace directory given (use --workspace <DIR>); nothing to sync");
        return Ok(());
    };

    let config = Config::from_args(&args, &workspace)?;

    info!("Starting scriptsync {}", env!("CARGO_PKG_VERSION"));
    info!("Workspace: {:?}", workspace);
    if config.monitor_only {
        info!("Monitor-only: changes are queued but not sent automatically");
    }

    let listener = WebSocketServer::bind(&config.listen).await?;
    let daemon = Daemon::new(workspace, &config)?;

    info!("Daemon running. Press Ctrl+C to stop.");
    daemon
        .run(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    info!("Shutting down");
    Ok(())
}
