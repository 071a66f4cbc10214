//! Debounced workspace file watching.
//!
//! Raw `notify` events are converted to workspace-relative [`FileEvent`]s,
//! merged per path, and emitted in batches once a path has been quiet for
//! the debounce period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::workspace::{has_extension, to_relative};

/// Errors that can occur in the file watcher.
#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("Failed to create watcher: {0}")]
    Create(String),

    #[error("Failed to watch {path}: {message}")]
    Watch { path: String, message: String },
}

/// A change to one workspace-relative file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEvent {
    Created(String),
    Modified(String),
    Deleted(String),
    /// (old path, new path)
    Renamed(String, String),
}

impl FileEvent {
    /// Path the event leaves behind.
    pub fn path(&self) -> &str {
        match self {
            Self::Created(p) | Self::Modified(p) | Self::Deleted(p) => p,
            Self::Renamed(_, new) => new,
        }
    }
}

/// Configuration for the file watcher.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,

    /// File extensions to watch
    pub extensions: Vec<String>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            extensions: ["rs", "py", "js", "ts", "tsx", "jsx", "go"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Directories whose churn is never interesting.
const IGNORED_COMPONENTS: &[&str] = &[".git", "target", "node_modules", "__pycache__", "dist"];

#[derive(Debug)]
struct PendingEvent {
    event: FileEvent,
    last_seen: Instant,
}

/// Recursive watcher over a workspace root.
pub struct FileWatcher {
    config: WatcherConfig,
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
}

impl FileWatcher {
    pub fn new(root: PathBuf, config: WatcherConfig) -> Self {
        let root = root.canonicalize().unwrap_or(root);
        Self {
            config,
            root,
            watcher: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Start watching and return a channel of debounced event batches.
    pub fn start(&mut self) -> Result<mpsc::Receiver<Vec<FileEvent>>, WatcherError> {
        let (raw_tx, raw_rx) = mpsc::channel::<FileEvent>(256);
        let (batch_tx, batch_rx) = mpsc::channel(32);
        let extensions = self.config.extensions.clone();
        let root = self.root.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                for file_event in convert_event(event, &root, &extensions) {
                    // Best effort: a full channel drops the event.
                    let _ = raw_tx.try_send(file_event);
                }
            }
        })
        .map_err(|e| WatcherError::Create(e.to_string()))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| WatcherError::Watch {
                path: self.root.display().to_string(),
                message: e.to_string(),
            })?;
        self.watcher = Some(watcher);

        tokio::spawn(debounce_events(raw_rx, batch_tx, self.config.debounce));

        info!("Started watching {:?} with {:?} debounce", self.root, self.config.debounce);
        Ok(batch_rx)
    }

    /// Stop watching. Pending events are flushed to the receiver.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!("Stopped watching {:?}", self.root);
        }
    }
}

/// Batch rapid changes per path and emit them once quiet.
async fn debounce_events(
    mut raw_rx: mpsc::Receiver<FileEvent>,
    batch_tx: mpsc::Sender<Vec<FileEvent>>,
    debounce: Duration,
) {
    let mut pending: HashMap<String, PendingEvent> = HashMap::new();
    let tick = Duration::from_millis(50).min(debounce.max(Duration::from_millis(1)));

    loop {
        match tokio::time::timeout(tick, raw_rx.recv()).await {
            Ok(Some(event)) => {
                let now = Instant::now();
                let key = event.path().to_string();
                match pending.get_mut(&key) {
                    Some(existing) => {
                        existing.event = merge_events(&existing.event, &event);
                        existing.last_seen = now;
                    }
                    None => {
                        pending.insert(key, PendingEvent { event, last_seen: now });
                    }
                }
            }
            Ok(None) => {
                let rest: Vec<FileEvent> = pending.drain().map(|(_, p)| p.event).collect();
                if !rest.is_empty() {
                    let _ = batch_tx.send(sorted(rest)).await;
                }
                return;
            }
            Err(_) => {}
        }

        let now = Instant::now();
        let mut ready = Vec::new();
        pending.retain(|_, p| {
            if now.duration_since(p.last_seen) >= debounce {
                ready.push(p.event.clone());
                false
            } else {
                true
            }
        });

        if !ready.is_empty() {
            debug!("Emitting {} debounced file events", ready.len());
            if batch_tx.send(sorted(ready)).await.is_err() {
                return;
            }
        }
    }
}

fn sorted(mut events: Vec<FileEvent>) -> Vec<FileEvent> {
    events.sort_by(|a, b| a.path().cmp(b.path()));
    events
}

/// Merge two events for the same path.
///
/// Delete after anything is a delete; create after delete means the file
/// was replaced, which is a modification; create then modify is a create.
fn merge_events(existing: &FileEvent, new: &FileEvent) -> FileEvent {
    match (existing, new) {
        (_, FileEvent::Deleted(p)) => FileEvent::Deleted(p.clone()),
        (FileEvent::Deleted(_), FileEvent::Created(p) | FileEvent::Modified(p)) => {
            FileEvent::Modified(p.clone())
        }
        (FileEvent::Created(p), FileEvent::Modified(_)) => FileEvent::Created(p.clone()),
        (FileEvent::Renamed(old, new_path), FileEvent::Modified(_) | FileEvent::Created(_)) => {
            FileEvent::Renamed(old.clone(), new_path.clone())
        }
        (_, latest) => latest.clone(),
    }
}

fn is_interesting(relative: &str, extensions: &[String]) -> bool {
    !relative.split('/').any(|part| IGNORED_COMPONENTS.contains(&part))
        && has_extension(Path::new(relative), extensions)
}

/// Convert a notify event into workspace-relative events.
fn convert_event(event: Event, root: &Path, extensions: &[String]) -> Vec<FileEvent> {
    let relative: Vec<Option<String>> = event
        .paths
        .iter()
        .map(|p| to_relative(root, p).filter(|r| is_interesting(r, extensions)))
        .collect();

    if let EventKind::Modify(ModifyKind::Name(mode)) = event.kind {
        return match (mode, relative.as_slice()) {
            (RenameMode::Both, [Some(from), Some(to)]) => {
                vec![FileEvent::Renamed(from.clone(), to.clone())]
            }
            (RenameMode::Both, [Some(from), None]) => vec![FileEvent::Deleted(from.clone())],
            (RenameMode::Both, [None, Some(to)]) => vec![FileEvent::Created(to.clone())],
            (RenameMode::From, _) => relative.iter().flatten().cloned().map(FileEvent::Deleted).collect(),
            (RenameMode::To, _) => relative.iter().flatten().cloned().map(FileEvent::Created).collect(),
            _ => relative.iter().flatten().cloned().map(FileEvent::Modified).collect(),
        };
    }

    let make: fn(String) -> FileEvent = match event.kind {
        EventKind::Create(_) => FileEvent::Created,
        EventKind::Modify(ModifyKind::Metadata(_)) => return Vec::new(),
        EventKind::Modify(_) => FileEvent::Modified,
        EventKind::Remove(_) => FileEvent::Deleted,
        _ => return Vec::new(),
    };
    relative.into_iter().flatten().map(make).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::tempdir;

    fn exts() -> Vec<String> {
        vec!["rs".to_string(), "ts".to_string()]
    }

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut e = Event::new(kind);
        for p in paths {
            e = e.add_path(PathBuf::from(p));
        }
        e
    }

    #[test]
    fn test_convert_create_and_remove() {
        let root = Path::new("/ws");
        let created = convert_event(event(EventKind::Create(CreateKind::File), &["/ws/src/a.rs"]), root, &exts());
        assert_eq!(created, vec![FileEvent::Created("src/a.rs".to_string())]);

        let removed = convert_event(event(EventKind::Remove(RemoveKind::File), &["/ws/b.ts"]), root, &exts());
        assert_eq!(removed, vec![FileEvent::Deleted("b.ts".to_string())]);
    }

    #[test]
    fn test_convert_filters_extensions_and_ignored_dirs() {
        let root = Path::new("/ws");
        let kind = EventKind::Modify(ModifyKind::Data(DataChange::Content));
        assert!(convert_event(event(kind, &["/ws/readme.md"]), root, &exts()).is_empty());
        assert!(convert_event(event(kind, &["/ws/target/debug/x.rs"]), root, &exts()).is_empty());
        assert!(convert_event(event(kind, &["/elsewhere/x.rs"]), root, &exts()).is_empty());
        assert_eq!(
            convert_event(event(kind, &["/ws/x.rs"]), root, &exts()),
            vec![FileEvent::Modified("x.rs".to_string())]
        );
    }

    #[test]
    fn test_convert_rename() {
        let root = Path::new("/ws");
        let kind = EventKind::Modify(ModifyKind::Name(RenameMode::Both));
        assert_eq!(
            convert_event(event(kind, &["/ws/a.rs", "/ws/b.rs"]), root, &exts()),
            vec![FileEvent::Renamed("a.rs".to_string(), "b.rs".to_string())]
        );
        // Renamed to an unwatched extension: the old file is gone.
        assert_eq!(
            convert_event(event(kind, &["/ws/a.rs", "/ws/a.rs.bak"]), root, &exts()),
            vec![FileEvent::Deleted("a.rs".to_string())]
        );
    }

    #[test]
    fn test_metadata_changes_are_ignored() {
        let root = Path::new("/ws");
        let kind = EventKind::Modify(ModifyKind::Metadata(notify::event::MetadataKind::Any));
        assert!(convert_event(event(kind, &["/ws/a.rs"]), root, &exts()).is_empty());
    }

    #[test]
    fn test_merge_events() {
        let p = || "a.rs".to_string();
        assert_eq!(
            merge_events(&FileEvent::Created(p()), &FileEvent::Deleted(p())),
            FileEvent::Deleted(p())
        );
        assert_eq!(
            merge_events(&FileEvent::Created(p()), &FileEvent::Modified(p())),
            FileEvent::Created(p())
        );
        assert_eq!(
            merge_events(&FileEvent::Deleted(p()), &FileEvent::Created(p())),
            FileEvent::Modified(p())
        );
        assert_eq!(
            merge_events(&FileEvent::Modified(p()), &FileEvent::Modified(p())),
            FileEvent::Modified(p())
        );
    }

    #[tokio::test]
    async fn test_debounce_collapses_burst() {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (batch_tx, mut batch_rx) = mpsc::channel(16);
        tokio::spawn(debounce_events(raw_rx, batch_tx, Duration::from_millis(30)));

        raw_tx.send(FileEvent::Created("a.rs".to_string())).await.unwrap();
        raw_tx.send(FileEvent::Modified("a.rs".to_string())).await.unwrap();
        raw_tx.send(FileEvent::Modified("b.rs".to_string())).await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            batch,
            vec![
                FileEvent::Created("a.rs".to_string()),
                FileEvent::Modified("b.rs".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_stop() {
        let dir = tempdir().unwrap();
        let mut watcher = FileWatcher::new(dir.path().to_path_buf(), WatcherConfig::default());
        assert!(!watcher.is_running());

        let _rx = watcher.start().unwrap();
        assert!(watcher.is_running());

        watcher.stop();
        assert!(!watcher.is_running());
    }
}
