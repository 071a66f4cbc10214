//! Active-branch tracking.
//!
//! Watches the repository's `HEAD` and reports branch switches to a
//! listener after a quiet period, so the burst of writes a checkout makes
//! collapses into one notification.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::watcher::WatcherError;

/// Receives branch switches.
#[async_trait]
pub trait BranchChangeListener: Send + Sync {
    /// Called once per debounced switch. An error leaves the watcher's
    /// notion of the current branch unchanged.
    async fn on_branch_changed(&self, old: Option<&str>, new: Option<&str>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchWatcherConfig {
    pub enabled: bool,
    pub debounce: Duration,
}

impl Default for BranchWatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: Duration::from_millis(500),
        }
    }
}

/// Locate the `HEAD` file for a workspace, following the `gitdir:` pointer
/// that worktrees and submodules use in place of a `.git` directory.
pub fn resolve_head_path(workspace_root: &Path) -> Option<PathBuf> {
    let dot_git = workspace_root.join(".git");
    if dot_git.is_dir() {
        return Some(dot_git.join("HEAD"));
    }
    let contents = std::fs::read_to_string(&dot_git).ok()?;
    let target = contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("gitdir:"))?
        .trim();
    let git_dir = Path::new(target);
    let git_dir = if git_dir.is_absolute() {
        git_dir.to_path_buf()
    } else {
        workspace_root.join(git_dir)
    };
    Some(git_dir.join("HEAD"))
}

/// Branch name from the contents of `HEAD`. A detached head yields the
/// commit id shortened to 12 characters.
pub fn parse_head(contents: &str) -> Option<String> {
    let head = contents.trim();
    if head.is_empty() {
        return None;
    }
    if let Some(reference) = head.strip_prefix("ref:") {
        let reference = reference.trim();
        let name = reference.strip_prefix("refs/heads/").unwrap_or(reference);
        return (!name.is_empty()).then(|| name.to_string());
    }
    if head.len() >= 12 && head.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(head[..12].to_string());
    }
    None
}

struct Shared {
    head_path: Option<PathBuf>,
    current: RwLock<Option<String>>,
    listener: Arc<dyn BranchChangeListener>,
}

impl Shared {
    fn current(&self) -> Option<String> {
        self.current.read().map(|c| c.clone()).unwrap_or(None)
    }

    fn set_current(&self, branch: Option<String>) {
        if let Ok(mut current) = self.current.write() {
            *current = branch;
        }
    }

    async fn read_branch(&self) -> Option<String> {
        let path = self.head_path.as_ref()?;
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => parse_head(&contents),
            Err(e) => {
                debug!("Could not read {:?}: {}", path, e);
                None
            }
        }
    }

    /// Compare `HEAD` with the cached branch and notify on a difference.
    async fn check(&self, cancel: &CancellationToken) {
        let new = self.read_branch().await;
        let old = self.current();
        if new == old {
            return;
        }
        if cancel.is_cancelled() {
            return;
        }

        info!(
            "Branch changed: {} -> {}",
            old.as_deref().unwrap_or("(none)"),
            new.as_deref().unwrap_or("(none)")
        );
        match self
            .listener
            .on_branch_changed(old.as_deref(), new.as_deref())
            .await
        {
            Ok(()) => self.set_current(new),
            Err(e) => warn!("Branch change handler failed, keeping {:?}: {:#}", old, e),
        }
    }
}

struct Running {
    _watcher: RecommendedWatcher,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Debounced watcher over a repository's `HEAD`.
pub struct BranchWatcher {
    shared: Arc<Shared>,
    config: Mutex<BranchWatcherConfig>,
    running: Mutex<Option<Running>>,
}

impl BranchWatcher {
    pub fn new(
        workspace_root: &Path,
        config: BranchWatcherConfig,
        listener: Arc<dyn BranchChangeListener>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                head_path: resolve_head_path(workspace_root),
                current: RwLock::new(None),
                listener,
            }),
            config: Mutex::new(config),
            running: Mutex::new(None),
        }
    }

    /// Read the current branch and, when enabled, start watching.
    pub async fn initialize(&self) -> Result<(), WatcherError> {
        let branch = self.shared.read_branch().await;
        debug!("Initial branch: {:?}", branch);
        self.shared.set_current(branch);

        let config = self.config.lock().await.clone();
        if config.enabled {
            self.start(config.debounce).await?;
        }
        Ok(())
    }

    pub fn get_current_branch(&self) -> Option<String> {
        self.shared.current()
    }

    pub fn head_path(&self) -> Option<&Path> {
        self.shared.head_path.as_deref()
    }

    /// Apply new settings, starting or stopping the watch as needed.
    pub async fn update_config(&self, config: BranchWatcherConfig) -> Result<(), WatcherError> {
        let previous = std::mem::replace(&mut *self.config.lock().await, config.clone());
        if previous == config {
            return Ok(());
        }
        self.stop().await;
        if config.enabled {
            self.start(config.debounce).await?;
        }
        Ok(())
    }

    /// Stop watching. No callback fires after this returns.
    pub async fn dispose(&self) {
        self.stop().await;
    }

    pub async fn is_watching(&self) -> bool {
        self.running.lock().await.is_some()
    }

    async fn start(&self, debounce: Duration) -> Result<(), WatcherError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let Some(head_path) = self.shared.head_path.clone() else {
            warn!("No git repository found, branch watching disabled");
            return Ok(());
        };
        // Git replaces HEAD by renaming a lock file over it, so watch the
        // directory and filter for HEAD.
        let Some(git_dir) = head_path.parent().map(Path::to_path_buf) else {
            return Ok(());
        };

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if event.paths.iter().any(|p| p.file_name().map_or(false, |n| n == "HEAD")) {
                    let _ = trigger_tx.send(());
                }
            }
        })
        .map_err(|e| WatcherError::Create(e.to_string()))?;
        watcher
            .watch(&git_dir, RecursiveMode::NonRecursive)
            .map_err(|e| WatcherError::Watch {
                path: git_dir.display().to_string(),
                message: e.to_string(),
            })?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            self.shared.clone(),
            trigger_rx,
            debounce,
            cancel.clone(),
        ));

        info!("Watching {:?} for branch changes", head_path);
        *running = Some(Running {
            _watcher: watcher,
            cancel,
            task,
        });
        Ok(())
    }

    async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            let _ = running.task.await;
            debug!("Stopped branch watcher");
        }
    }

    #[cfg(test)]
    async fn check_now(&self) {
        self.shared.check(&CancellationToken::new()).await;
    }
}

async fn debounce_loop(
    shared: Arc<Shared>,
    mut triggers: mpsc::UnboundedReceiver<()>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    return;
                }
            }
        }

        // Restart the timer on every trigger until HEAD is quiet.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        return;
                    }
                }
                _ = tokio::time::sleep(debounce) => break,
            }
        }

        shared.check(&cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingListener {
        calls: std::sync::Mutex<Vec<(Option<String>, Option<String>)>>,
        fail: AtomicBool,
        count: AtomicUsize,
    }

    #[async_trait]
    impl BranchChangeListener for RecordingListener {
        async fn on_branch_changed(&self, old: Option<&str>, new: Option<&str>) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push((old.map(String::from), new.map(String::from)));
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("listener failed");
            }
            Ok(())
        }
    }

    fn repo(branch: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        write_head(dir.path(), branch);
        dir
    }

    fn write_head(root: &Path, branch: &str) {
        fs::write(root.join(".git/HEAD"), format!("ref: refs/heads/{branch}\n")).unwrap();
    }

    fn disabled() -> BranchWatcherConfig {
        BranchWatcherConfig {
            enabled: false,
            debounce: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_parse_head() {
        assert_eq!(parse_head("ref: refs/heads/main\n"), Some("main".to_string()));
        assert_eq!(
            parse_head("ref: refs/heads/feature/login"),
            Some("feature/login".to_string())
        );
        assert_eq!(
            parse_head("0123456789abcdef0123456789abcdef01234567\n"),
            Some("0123456789ab".to_string())
        );
        assert_eq!(parse_head(""), None);
        assert_eq!(parse_head("garbage"), None);
    }

    #[test]
    fn test_resolve_head_path_follows_gitdir_file() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("main-repo/.git/worktrees/wt");
        fs::create_dir_all(&real).unwrap();
        let worktree = dir.path().join("wt");
        fs::create_dir_all(&worktree).unwrap();
        fs::write(worktree.join(".git"), format!("gitdir: {}\n", real.display())).unwrap();

        assert_eq!(resolve_head_path(&worktree), Some(real.join("HEAD")));

        let plain = repo("main");
        assert_eq!(
            resolve_head_path(plain.path()),
            Some(plain.path().join(".git/HEAD"))
        );
        assert_eq!(resolve_head_path(TempDir::new().unwrap().path()), None);
    }

    #[tokio::test]
    async fn test_initialize_reads_branch() {
        let dir = repo("main");
        let watcher = BranchWatcher::new(dir.path(), disabled(), Arc::new(RecordingListener::default()));
        watcher.initialize().await.unwrap();
        assert_eq!(watcher.get_current_branch().as_deref(), Some("main"));
        assert!(!watcher.is_watching().await);
    }

    #[tokio::test]
    async fn test_failed_listener_keeps_previous_branch() {
        let dir = repo("main");
        let listener = Arc::new(RecordingListener::default());
        let watcher = BranchWatcher::new(dir.path(), disabled(), listener.clone());
        watcher.initialize().await.unwrap();

        listener.fail.store(true, Ordering::SeqCst);
        write_head(dir.path(), "feature");
        watcher.check_now().await;
        assert_eq!(watcher.get_current_branch().as_deref(), Some("main"));

        listener.fail.store(false, Ordering::SeqCst);
        write_head(dir.path(), "release");
        watcher.check_now().await;
        assert_eq!(watcher.get_current_branch().as_deref(), Some("release"));

        let calls = listener.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                (Some("main".to_string()), Some("feature".to_string())),
                (Some("main".to_string()), Some("release".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_unchanged_head_does_not_notify() {
        let dir = repo("main");
        let listener = Arc::new(RecordingListener::default());
        let watcher = BranchWatcher::new(dir.path(), disabled(), listener.clone());
        watcher.initialize().await.unwrap();
        write_head(dir.path(), "main");
        watcher.check_now().await;
        assert_eq!(listener.count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_debounce_collapses_triggers() {
        let dir = repo("main");
        let listener = Arc::new(RecordingListener::default());
        let watcher = BranchWatcher::new(dir.path(), disabled(), listener.clone());
        watcher.initialize().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            watcher.shared.clone(),
            rx,
            Duration::from_millis(30),
            cancel.clone(),
        ));

        write_head(dir.path(), "a");
        tx.send(()).unwrap();
        write_head(dir.path(), "b");
        tx.send(()).unwrap();
        tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(listener.count.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.get_current_branch().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_no_callback_after_dispose() {
        let dir = repo("main");
        let listener = Arc::new(RecordingListener::default());
        let watcher = BranchWatcher::new(dir.path(), disabled(), listener.clone());
        watcher.initialize().await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(debounce_loop(
            watcher.shared.clone(),
            rx,
            Duration::from_millis(50),
            cancel.clone(),
        ));

        write_head(dir.path(), "feature");
        tx.send(()).unwrap();
        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.count.load(Ordering::SeqCst), 0);
        assert_eq!(watcher.get_current_branch().as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_update_config_toggles_watch() {
        let dir = repo("main");
        let watcher = BranchWatcher::new(dir.path(), disabled(), Arc::new(RecordingListener::default()));
        watcher.initialize().await.unwrap();
        assert!(!watcher.is_watching().await);

        watcher
            .update_config(BranchWatcherConfig {
                enabled: true,
                debounce: Duration::from_millis(20),
            })
            .await
            .unwrap();
        assert!(watcher.is_watching().await);

        watcher.update_config(disabled()).await.unwrap();
        assert!(!watcher.is_watching().await);
        watcher.dispose().await;
    }

    #[tokio::test]
    async fn test_checkout_is_detected_through_filesystem_events() {
        let dir = repo("main");
        let listener = Arc::new(RecordingListener::default());
        let watcher = BranchWatcher::new(
            dir.path(),
            BranchWatcherConfig {
                enabled: true,
                debounce: Duration::from_millis(50),
            },
            listener.clone(),
        );
        watcher.initialize().await.unwrap();

        write_head(dir.path(), "develop");
        for _ in 0..100 {
            if watcher.get_current_branch().as_deref() == Some("develop") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        watcher.dispose().await;
        assert_eq!(watcher.get_current_branch().as_deref(), Some("develop"));
    }
}
