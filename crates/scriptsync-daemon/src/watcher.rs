//! File watcher with debouncing for workspace changes.
//!
//! Uses notify-debouncer-mini for efficient file change detection. The
//! debouncer reports no renames, so a batch holding exactly one deletion and
//! one newly created file with the same extension is reported as a rename.

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEvent};
use scriptsync_core::requests::is_request_path;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// File event from the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    /// Path relative to the workspace root, `/`-separated
    pub path: String,
    pub kind: FileEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEventKind {
    /// File was created or modified
    Modified,
    Deleted,
    /// File was moved here from `from`
    Renamed { from: String },
}

/// Event plus whether the file was unknown before it.
#[derive(Debug, Clone)]
struct Observed {
    event: FileEvent,
    created: bool,
}

/// Last seen mtime per relative path. Filters spurious events and tells new
/// files from modified ones.
type MtimeCache = Arc<Mutex<HashMap<PathBuf, SystemTime>>>;

fn lock(cache: &MtimeCache) -> MutexGuard<'_, HashMap<PathBuf, SystemTime>> {
    cache.lock().unwrap_or_else(|e| e.into_inner())
}

/// Workspace-relative `/`-separated form of `relative`, if every component
/// is a plain name.
fn to_workspace_path(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// True for paths the engine should hear about: request files, plus any
/// path with no hidden segment.
pub fn is_watched(path: &str) -> bool {
    is_request_path(path) || !path.split('/').any(|segment| segment.starts_with('.'))
}

fn extension(path: &str) -> Option<&str> {
    Path::new(path).extension().and_then(|ext| ext.to_str())
}

fn pair_renames(batch: Vec<Observed>) -> Vec<FileEvent> {
    let candidates = |wanted: fn(&Observed) -> bool| -> Vec<String> {
        batch
            .iter()
            .filter(|o| wanted(o) && !is_request_path(&o.event.path))
            .map(|o| o.event.path.clone())
            .collect()
    };
    let deleted = candidates(|o| o.event.kind == FileEventKind::Deleted);
    let created = candidates(|o| o.created);

    let (from, to) = match (deleted.as_slice(), created.as_slice()) {
        ([from], [to]) if extension(from) == extension(to) => (from.clone(), to.clone()),
        _ => return batch.into_iter().map(|o| o.event).collect(),
    };

    debug!("Treating {} -> {} as a rename", from, to);
    batch
        .into_iter()
        .filter_map(|o| {
            if o.event.path == from {
                None
            } else if o.event.path == to {
                Some(FileEvent {
                    path: to.clone(),
                    kind: FileEventKind::Renamed { from: from.clone() },
                })
            } else {
                Some(o.event)
            }
        })
        .collect()
}

/// Record the mtime of every visible file so that later events can tell
/// creations from modifications.
fn seed_mtimes(root: &Path, dir: &Path, cache: &mut HashMap<PathBuf, SystemTime>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            seed_mtimes(root, &path, cache);
        } else if let (Ok(relative), Ok(mtime)) = (path.strip_prefix(root), metadata.modified()) {
            cache.insert(relative.to_path_buf(), mtime);
        }
    }
}

/// File watcher that monitors the workspace directory.
pub struct FileWatcher {
    workspace_path: PathBuf,
    /// Debouncer handle (must keep alive)
    _debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    event_rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl FileWatcher {
    /// Create a new file watcher for the workspace.
    ///
    /// Uses 200ms debounce period to avoid rapid-fire events during saves.
    pub fn new(workspace_path: PathBuf) -> Result<Self> {
        // FSEvents on macOS needs the real path (/private/var/... for temp dirs).
        let workspace_path = workspace_path.canonicalize().unwrap_or(workspace_path);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let root = workspace_path.clone();

        let mtime_cache: MtimeCache = Arc::new(Mutex::new(HashMap::new()));
        seed_mtimes(&workspace_path, &workspace_path, &mut lock(&mtime_cache));
        let callback_cache = Arc::clone(&mtime_cache);

        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            move |result: Result<Vec<DebouncedEvent>, notify::Error>| match result {
                Ok(events) => {
                    let batch = events
                        .iter()
                        .filter_map(|event| Self::process_event(event, &root, &callback_cache))
                        .collect();
                    for file_event in pair_renames(batch) {
                        if event_tx.send(file_event).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!("File watcher error: {}", e);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(&workspace_path, RecursiveMode::Recursive)?;

        Ok(Self {
            workspace_path,
            _debouncer: debouncer,
            event_rx,
        })
    }

    /// Process a single debounced event, returning it if relevant.
    fn process_event(
        event: &DebouncedEvent,
        workspace_path: &Path,
        mtime_cache: &MtimeCache,
    ) -> Option<Observed> {
        let path = &event.path;
        let relative = path.strip_prefix(workspace_path).ok()?;
        let relative_str = to_workspace_path(relative)?;

        if !is_watched(&relative_str) {
            return None;
        }

        // Directory events carry no content of their own.
        if path.is_dir() {
            return None;
        }

        let relative_path = relative.to_path_buf();
        let mut created = false;
        let kind = if path.exists() {
            if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
                let mut cache = lock(mtime_cache);
                match cache.insert(relative_path, mtime) {
                    // Mtime unchanged: spurious event (seen on Docker volumes).
                    Some(last_mtime) if last_mtime == mtime => return None,
                    Some(_) => {}
                    None => created = true,
                }
            }
            FileEventKind::Modified
        } else {
            if lock(mtime_cache).remove(&relative_path).is_none() {
                // Created and deleted inside one debounce window.
                return None;
            }
            FileEventKind::Deleted
        };

        debug!("File event: {:?} - {}", kind, relative_str);

        Some(Observed {
            event: FileEvent {
                path: relative_str,
                kind,
            },
            created,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<FileEvent> {
        &mut self.event_rx
    }

    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(path: &str, kind: FileEventKind, created: bool) -> Observed {
        Observed {
            event: FileEvent {
                path: path.to_string(),
                kind,
            },
            created,
        }
    }

    #[test]
    fn test_is_watched() {
        assert!(is_watched("acme/global/sys_script_include/Util.script.js"));
        assert!(is_watched("acme/global/sys_script_include/_map.json"));
        assert!(is_watched(".scriptsync/requests/r1.json"));
        assert!(!is_watched(".scriptsync/responses/r1.json"));
        assert!(!is_watched(".scriptsync/last_error.json"));
        assert!(!is_watched(".git/HEAD"));
        assert!(!is_watched("acme/.hidden/file.js"));
    }

    #[test]
    fn test_workspace_path_uses_forward_slashes() {
        let relative: PathBuf = ["acme", "global", "sys_script", "A.script.js"].iter().collect();
        assert_eq!(
            to_workspace_path(&relative).as_deref(),
            Some("acme/global/sys_script/A.script.js")
        );
        assert_eq!(to_workspace_path(Path::new("")), None);
    }

    #[test]
    fn test_delete_plus_create_becomes_rename() {
        let batch = vec![
            observed("t/Old.script.js", FileEventKind::Deleted, false),
            observed("t/New.script.js", FileEventKind::Modified, true),
            observed("t/Other.script.js", FileEventKind::Modified, false),
        ];

        let events = pair_renames(batch);
        assert_eq!(
            events,
            vec![
                FileEvent {
                    path: "t/New.script.js".into(),
                    kind: FileEventKind::Renamed {
                        from: "t/Old.script.js".into()
                    },
                },
                FileEvent {
                    path: "t/Other.script.js".into(),
                    kind: FileEventKind::Modified,
                },
            ]
        );
    }

    #[test]
    fn test_ambiguous_batches_are_left_alone() {
        let different_extension = vec![
            observed("t/Old.script.js", FileEventKind::Deleted, false),
            observed("t/New.html", FileEventKind::Modified, true),
        ];
        assert_eq!(pair_renames(different_extension).len(), 2);

        let two_created = vec![
            observed("t/Old.script.js", FileEventKind::Deleted, false),
            observed("t/A.script.js", FileEventKind::Modified, true),
            observed("t/B.script.js", FileEventKind::Modified, true),
        ];
        let events = pair_renames(two_created);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|e| !matches!(e.kind, FileEventKind::Renamed { .. })));

        let request = vec![
            observed(".scriptsync/requests/r1.json", FileEventKind::Deleted, false),
            observed("t/New.json", FileEventKind::Modified, true),
        ];
        assert_eq!(pair_renames(request).len(), 2);
    }
}
