//! FileSystem trait abstraction for workspace file operations.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in scriptsync-daemon) - Uses tokio::fs
//!
//! All paths are workspace-relative and `/`-separated.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Path escapes workspace: {0}")]
    OutsideWorkspace(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Workspace filesystem used by the sync engine.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write file contents (creates parent directories if needed)
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Delete a file
    async fn delete(&self, path: &str) -> Result<()>;

    /// Move a file, creating the destination's parent directories
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read a file as UTF-8, returning `None` when it does not exist.
    async fn read_string_opt(&self, path: &str) -> Result<Option<String>> {
        match self.read(path).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| FsError::Io(format!("{}: {}", path, e))),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<BTreeMap<String, Vec<u8>>>,
    dirs: RwLock<BTreeSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(BTreeMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// Read a file as a string, for assertions in tests.
    pub fn contents(&self, path: &str) -> Option<String> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&Self::normalize_path(path))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// All file paths currently stored.
    pub fn paths(&self) -> Vec<String> {
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files.keys().cloned().collect()
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn ensure_parents(&self, path: &str) {
        let mut dirs = self.dirs.write().unwrap_or_else(|e| e.into_inner());
        let mut current = String::new();
        let segments: Vec<&str> = path.split('/').collect();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            dirs.insert(current.clone());
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        files
            .get(&path)
            .cloned()
            .ok_or(FsError::NotFound(path))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self
            .dirs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&path)
        {
            return Err(FsError::AlreadyExists(path));
        }
        self.ensure_parents(&path);

        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(path, content.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files
            .remove(&path)
            .map(|_| ())
            .ok_or(FsError::NotFound(path))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        let content = {
            let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
            if files.contains_key(&to) {
                return Err(FsError::AlreadyExists(to));
            }
            files.remove(&from).ok_or(FsError::NotFound(from))?
        };
        self.ensure_parents(&to);
        let mut files = self.files.write().unwrap_or_else(|e| e.into_inner());
        files.insert(to, content);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(|e| e.into_inner());
        let dirs = self.dirs.read().unwrap_or_else(|e| e.into_inner());
        Ok(files.contains_key(&path) || dirs.contains(&path))
    }
}

// Lets tests keep a handle on the filesystem they hand to the engine.
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.write("test.txt", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");

        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_inmemory_fs_directories() {
        let fs = InMemoryFs::new();

        fs.write("acme/global/sys_script/a.script.js", b"x")
            .await
            .unwrap();

        assert!(fs.exists("acme").await.unwrap());
        assert!(fs.exists("acme/global/sys_script").await.unwrap());

        // A directory cannot be overwritten by a file.
        let result = fs.write("acme/global", b"x").await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_rename_moves_content() {
        let fs = InMemoryFs::new();
        fs.write("a/old.txt", b"body").await.unwrap();

        fs.rename("a/old.txt", "b/new.txt").await.unwrap();

        assert!(!fs.exists("a/old.txt").await.unwrap());
        assert_eq!(fs.contents("b/new.txt").as_deref(), Some("body"));

        fs.write("a/other.txt", b"other").await.unwrap();
        let result = fs.rename("a/other.txt", "b/new.txt").await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
        assert_eq!(fs.contents("a/other.txt").as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_read_string_opt_missing_is_none() {
        let fs = InMemoryFs::new();
        assert_eq!(fs.read_string_opt("nope.json").await.unwrap(), None);
    }
}
