//! scriptsync-daemon library: the native pieces around `scriptsync-core`.
//!
//! Exposed as a library so integration tests can drive the server and the
//! event loop directly.

pub mod config;
pub mod connection;
pub mod daemon;
pub mod host;
pub mod native_fs;
pub mod server;
pub mod watcher;

pub use config::{Args, Config};
pub use connection::{AgentConnection, ConnectionEvent};
pub use daemon::Daemon;
pub use host::HeadlessHost;
pub use native_fs::NativeFs;
pub use server::{ServerEvent, WebSocketServer};
pub use watcher::{FileEvent, FileEventKind, FileWatcher};
