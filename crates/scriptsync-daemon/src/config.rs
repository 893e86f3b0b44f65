//! Daemon configuration.
//!
//! Values come from an optional `scriptsync.json` in the workspace root;
//! command-line flags override whatever the file says.

use anyhow::{Context, Result};
use clap::Parser;
use scriptsync_core::record::FolderRecordTables;
use scriptsync_core::scope::RetryPolicy;
use scriptsync_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "scriptsync.json";

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "scriptsync")]
#[command(about = "Sync a script workspace with remote records through a browser agent")]
pub struct Args {
    /// Path to the workspace directory
    #[arg(short, long)]
    pub workspace: Option<PathBuf>,

    /// Address the agent connects to (overrides the config file)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Quiet period before queued changes are sent, in milliseconds
    #[arg(long)]
    pub settle_delay_ms: Option<u64>,

    /// Track changes without sending them until an explicit flush
    #[arg(long)]
    pub monitor_only: bool,

    /// Log files written by the agent as opened
    #[arg(long)]
    pub open_on_write: bool,

    /// Alternate config file (defaults to scriptsync.json in the workspace)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    #[serde(default)]
    pub monitor_only: bool,

    #[serde(default)]
    pub folder_record_tables: FolderRecordTables,

    #[serde(default = "default_scope_retry_limit")]
    pub scope_retry_limit: u32,

    #[serde(default = "default_scope_retry_delay_ms")]
    pub scope_retry_delay_ms: u64,

    #[serde(default)]
    pub open_on_write: bool,
}

fn default_listen() -> String {
    "127.0.0.1:1978".to_string()
}

fn default_settle_delay_ms() -> u64 {
    3000
}

fn default_scope_retry_limit() -> u32 {
    RetryPolicy::default().limit
}

fn default_scope_retry_delay_ms() -> u64 {
    RetryPolicy::default().delay.as_millis() as u64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            settle_delay_ms: default_settle_delay_ms(),
            monitor_only: false,
            folder_record_tables: FolderRecordTables::default(),
            scope_retry_limit: default_scope_retry_limit(),
            scope_retry_delay_ms: default_scope_retry_delay_ms(),
            open_on_write: false,
        }
    }
}

impl Config {
    /// Read the config file if present. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Load the file the arguments point at, then apply the flag overrides.
    pub fn from_args(args: &Args, workspace: &Path) -> Result<Self> {
        let path = args
            .config
            .clone()
            .unwrap_or_else(|| workspace.join(CONFIG_FILE));
        let mut config = Self::load(&path)?;
        config.apply(args);
        Ok(config)
    }

    pub fn apply(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.listen = listen.clone();
        }
        if let Some(delay) = args.settle_delay_ms {
            self.settle_delay_ms = delay;
        }
        if args.monitor_only {
            self.monitor_only = true;
        }
        if args.open_on_write {
            self.open_on_write = true;
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            monitoring: !self.monitor_only,
            folder_tables: self.folder_record_tables.clone(),
            scope_retry: RetryPolicy {
                limit: self.scope_retry_limit,
                delay: Duration::from_millis(self.scope_retry_delay_ms),
            },
            open_on_write: self.open_on_write,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.listen, "127.0.0.1:1978");
        assert_eq!(config.settle_delay_ms, 3000);
        assert_eq!(config.scope_retry_limit, 2);
        assert_eq!(config.scope_retry_delay_ms, 2500);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(
            &path,
            r#"{"settle_delay_ms": 500, "folder_record_tables": ["sp_widget"]}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.settle_delay_ms, 500);
        assert!(config.folder_record_tables.contains("sp_widget"));
        assert!(!config.folder_record_tables.contains("sys_ui_page"));
        assert_eq!(config.listen, "127.0.0.1:1978");
        assert!(!config.monitor_only);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"listen": "127.0.0.1:4000", "settle_delay_ms": 500}"#,
        )
        .unwrap();

        let args = Args::try_parse_from([
            "scriptsync",
            "--listen",
            "0.0.0.0:5000",
            "--monitor-only",
        ])
        .unwrap();
        let config = Config::from_args(&args, dir.path()).unwrap();

        assert_eq!(config.listen, "0.0.0.0:5000");
        assert_eq!(config.settle_delay_ms, 500);
        assert!(config.monitor_only);
    }

    #[test]
    fn test_engine_config_conversion() {
        let config = Config {
            settle_delay_ms: 1200,
            monitor_only: true,
            scope_retry_limit: 4,
            scope_retry_delay_ms: 100,
            ..Config::default()
        };
        let engine = config.engine_config();
        assert_eq!(engine.settle_delay, Duration::from_millis(1200));
        assert!(!engine.monitoring);
        assert_eq!(engine.scope_retry.limit, 4);
        assert_eq!(engine.scope_retry.delay, Duration::from_millis(100));
    }
}
