//! Headless host: user-facing messages go to the log.

use crate::native_fs::NativeFs;
use async_trait::async_trait;
use scriptsync_core::fs::{FileSystem, Result};
use scriptsync_core::HostEditor;
use std::sync::Arc;
use tracing::{error, info};

pub struct HeadlessHost {
    fs: Arc<NativeFs>,
}

impl HeadlessHost {
    pub fn new(fs: Arc<NativeFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl HostEditor for HeadlessHost {
    fn show_info(&self, message: &str) {
        info!("{}", message);
    }

    fn show_error(&self, message: &str) {
        error!("{}", message);
    }

    async fn revert_rename(&self, current: &str, original: &str) -> Result<()> {
        info!("Reverting rename: {} -> {}", current, original);
        self.fs.rename(current, original).await
    }

    async fn open_file(&self, path: &str) {
        info!("Opened {}", self.fs.base_path().join(path).display());
    }
}
