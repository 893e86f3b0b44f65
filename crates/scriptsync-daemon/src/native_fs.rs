//! Native filesystem implementation using tokio::fs.

use async_trait::async_trait;
use scriptsync_core::fs::{FileSystem, FsError, Result};
use scriptsync_core::requests::is_contained;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Workspace filesystem rooted at a directory. Paths that would leave the
/// root are refused.
pub struct NativeFs {
    base_path: PathBuf,
}

fn io_error(path: &str, e: std::io::Error) -> FsError {
    match e.kind() {
        ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(format!("{}: {}", path, e)),
    }
}

impl NativeFs {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, path: &str) -> Result<PathBuf> {
        if path.is_empty() {
            return Ok(self.base_path.clone());
        }
        if !is_contained(path) {
            return Err(FsError::OutsideWorkspace(path.to_string()));
        }
        Ok(self.base_path.join(path))
    }

    async fn create_parent(&self, full_path: &Path, path: &str) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl FileSystem for NativeFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path).await.map_err(|e| io_error(path, e))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        self.create_parent(&full_path, path).await?;
        fs::write(&full_path, content)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| io_error(path, e))?;

        if metadata.is_dir() {
            fs::remove_dir(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        } else {
            fs::remove_file(&full_path)
                .await
                .map_err(|e| io_error(path, e))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from)?;
        let to_path = self.full_path(to)?;
        if fs::try_exists(&to_path).await.map_err(|e| io_error(to, e))? {
            return Err(FsError::AlreadyExists(to.to_string()));
        }
        self.create_parent(&to_path, to).await?;
        fs::rename(&from_path, &to_path)
            .await
            .map_err(|e| io_error(from, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        fs::try_exists(&full_path)
            .await
            .map_err(|e| io_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_write_nested() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("acme/global/sys_script_include/Util.script.js", b"var a;")
            .await
            .unwrap();
        let content = fs
            .read("acme/global/sys_script_include/Util.script.js")
            .await
            .unwrap();
        assert_eq!(content, b"var a;");
        assert!(fs.exists("acme/global/sys_script_include").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_file_maps_to_not_found() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        assert!(matches!(fs.read("nope.txt").await, Err(FsError::NotFound(_))));
        assert_eq!(fs.read_string_opt("nope.txt").await.unwrap(), None);
        assert!(!fs.exists("nope.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_refused() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().join("workspace"));

        for path in ["../escape.txt", "a/../../escape.txt", "/etc/passwd"] {
            assert!(
                matches!(fs.write(path, b"x").await, Err(FsError::OutsideWorkspace(_))),
                "{} should be refused",
                path
            );
        }
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn test_rename_creates_parent_and_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write("a/One.script.js", b"1").await.unwrap();
        fs.write("b/Two.script.js", b"2").await.unwrap();

        fs.rename("a/One.script.js", "c/One.script.js").await.unwrap();
        assert!(!fs.exists("a/One.script.js").await.unwrap());
        assert_eq!(fs.read("c/One.script.js").await.unwrap(), b"1");

        let result = fs.rename("c/One.script.js", "b/Two.script.js").await;
        assert!(matches!(result, Err(FsError::AlreadyExists(_))));
        assert_eq!(fs.read("b/Two.script.js").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_delete_file() {
        let dir = TempDir::new().unwrap();
        let fs = NativeFs::new(dir.path().to_path_buf());

        fs.write(".scriptsync/requests/r1.json", b"{}").await.unwrap();
        fs.delete(".scriptsync/requests/r1.json").await.unwrap();
        assert!(!fs.exists(".scriptsync/requests/r1.json").await.unwrap());
        assert!(matches!(
            fs.delete(".scriptsync/requests/r1.json").await,
            Err(FsError::NotFound(_))
        ));
    }
}
