//! The editor (or headless stand-in) the engine reports to.

use crate::fs::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[cfg(any(test, feature = "test-util"))]
pub use recording::{HostCall, RecordingHost};

/// User-facing primitives supplied by whatever hosts the engine.
#[async_trait]
pub trait HostEditor: Send + Sync {
    fn show_info(&self, message: &str);

    fn show_error(&self, message: &str);

    /// Undo a rename by moving `current` back to `original`.
    async fn revert_rename(&self, current: &str, original: &str) -> Result<()>;

    /// Bring a workspace file to the user's attention.
    async fn open_file(&self, path: &str);
}

#[async_trait]
impl<T: HostEditor + ?Sized> HostEditor for Arc<T> {
    fn show_info(&self, message: &str) {
        (**self).show_info(message)
    }

    fn show_error(&self, message: &str) {
        (**self).show_error(message)
    }

    async fn revert_rename(&self, current: &str, original: &str) -> Result<()> {
        (**self).revert_rename(current, original).await
    }

    async fn open_file(&self, path: &str) {
        (**self).open_file(path).await
    }
}

#[cfg(any(test, feature = "test-util"))]
mod recording {
    use super::HostEditor;
    use crate::fs::{FileSystem, Result};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    /// A call observed by [`RecordingHost`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum HostCall {
        Info(String),
        Error(String),
        Revert { current: String, original: String },
        Open(String),
    }

    /// Host for tests: records every call and performs reverts on a filesystem.
    pub struct RecordingHost {
        fs: Arc<dyn FileSystem>,
        calls: Mutex<Vec<HostCall>>,
    }

    impl RecordingHost {
        pub fn new(fs: Arc<dyn FileSystem>) -> Self {
            Self {
                fs,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> Vec<HostCall> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn errors(&self) -> Vec<String> {
            self.calls()
                .into_iter()
                .filter_map(|call| match call {
                    HostCall::Error(message) => Some(message),
                    _ => None,
                })
                .collect()
        }

        fn record(&self, call: HostCall) {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(call);
        }
    }

    #[async_trait]
    impl HostEditor for RecordingHost {
        fn show_info(&self, message: &str) {
            self.record(HostCall::Info(message.to_string()));
        }

        fn show_error(&self, message: &str) {
            self.record(HostCall::Error(message.to_string()));
        }

        async fn revert_rename(&self, current: &str, original: &str) -> Result<()> {
            self.record(HostCall::Revert {
                current: current.to_string(),
                original: original.to_string(),
            });
            self.fs.rename(current, original).await
        }

        async fn open_file(&self, path: &str) {
            self.record(HostCall::Open(path.to_string()));
        }
    }
}
