//! Durable content-fingerprint cache for change detection.
//!
//! One entry per workspace-relative file path records the content hash that
//! was last indexed. Single-key writes are coalesced by a background flusher;
//! batched writes are persisted immediately and roll back on failure.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::workspace::workspace_hash;

/// Current on-disk document version.
const DOCUMENT_VERSION: u32 = 1;

/// Default quiet period before a background flush.
pub const DEFAULT_FLUSH_DEBOUNCE: Duration = Duration::from_millis(1500);

/// Fingerprint of one indexed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    /// Workspace-relative path
    pub path: String,
    /// SHA256 hex digest of the indexed content
    pub hash: String,
    /// When this fingerprint was stored
    pub stored_at: SystemTime,
}

impl FingerprintEntry {
    fn new(path: String, hash: String) -> Self {
        Self {
            path,
            hash,
            stored_at: SystemTime::now(),
        }
    }
}

/// Errors that can occur when persisting fingerprints.
#[derive(Debug, thiserror::Error)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Failed to parse fingerprint store: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("Failed to serialize fingerprint store: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Durable backing storage for the fingerprint map.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Load every persisted entry. A missing store is an empty map.
    async fn load(&self) -> Result<HashMap<String, FingerprintEntry>, FingerprintError>;

    /// Replace the persisted state with `entries`, atomically.
    async fn save(&self, entries: &HashMap<String, FingerprintEntry>) -> Result<(), FingerprintError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct FingerprintDocument {
    version: u32,
    entries: BTreeMap<String, FingerprintEntry>,
}

/// JSON document store, one file per workspace.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store for `workspace_root` inside `state_dir`, keyed by a hash of the
    /// workspace's absolute path.
    pub fn for_workspace(state_dir: &Path, workspace_root: &Path) -> Self {
        let hash = workspace_hash(workspace_root);
        Self::new(state_dir.join(format!("fingerprints-{}.json", &hash[..16])))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FingerprintStore for JsonFileStore {
    async fn load(&self) -> Result<HashMap<String, FingerprintEntry>, FingerprintError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(FingerprintError::Io(e)),
        };
        let document: FingerprintDocument =
            serde_json::from_str(&content).map_err(FingerprintError::Parse)?;
        Ok(document.entries.into_iter().collect())
    }

    async fn save(&self, entries: &HashMap<String, FingerprintEntry>) -> Result<(), FingerprintError> {
        let document = FingerprintDocument {
            version: DOCUMENT_VERSION,
            entries: entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        };
        let content =
            serde_json::to_string_pretty(&document).map_err(FingerprintError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FingerprintError::Io)?;
        }
        // Write-then-rename so a crash never leaves a truncated document.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(FingerprintError::Io)?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(FingerprintError::Io)
    }
}

/// Volatile store used when no state directory is available.
#[derive(Debug, Default)]
pub struct MemoryFingerprintStore {
    entries: std::sync::Mutex<HashMap<String, FingerprintEntry>>,
}

#[async_trait]
impl FingerprintStore for MemoryFingerprintStore {
    async fn load(&self) -> Result<HashMap<String, FingerprintEntry>, FingerprintError> {
        Ok(self
            .entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn save(&self, entries: &HashMap<String, FingerprintEntry>) -> Result<(), FingerprintError> {
        if let Ok(mut stored) = self.entries.lock() {
            *stored = entries.clone();
        }
        Ok(())
    }
}

struct Inner {
    entries: RwLock<HashMap<String, FingerprintEntry>>,
    store: Arc<dyn FingerprintStore>,
    dirty: AtomicBool,
    // Serializes durable writes: one in-flight save per cache.
    write_lock: Mutex<()>,
    notify: Notify,
    debounce: Duration,
}

impl Inner {
    async fn persist(&self) -> Result<(), FingerprintError> {
        let _write = self.write_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.entries.read().await.clone();
        if let Err(e) = self.store.save(&snapshot).await {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(e);
        }
        debug!("Flushed {} fingerprints", snapshot.len());
        Ok(())
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// Content-fingerprint cache with debounced persistence.
pub struct ContentFingerprintCache {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    flusher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ContentFingerprintCache {
    /// Load the cache from `store` and start its background flusher.
    pub async fn open(
        store: Arc<dyn FingerprintStore>,
        debounce: Duration,
    ) -> Result<Self, FingerprintError> {
        let entries = store.load().await?;
        info!("Loaded {} fingerprints", entries.len());

        let inner = Arc::new(Inner {
            entries: RwLock::new(entries),
            store,
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
            notify: Notify::new(),
            debounce,
        });
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_flusher(inner.clone(), shutdown.clone()));

        Ok(Self {
            inner,
            shutdown,
            flusher: std::sync::Mutex::new(Some(handle)),
        })
    }

    /// Hash stored for `path`, if any.
    pub async fn get(&self, path: &str) -> Option<String> {
        self.inner
            .entries
            .read()
            .await
            .get(path)
            .map(|e| e.hash.clone())
    }

    /// Full entry stored for `path`, if any.
    pub async fn get_entry(&self, path: &str) -> Option<FingerprintEntry> {
        self.inner.entries.read().await.get(path).cloned()
    }

    /// Record `hash` for `path`. Persisted by the next debounced flush.
    pub async fn set(&self, path: &str, hash: &str) {
        self.inner.entries.write().await.insert(
            path.to_string(),
            FingerprintEntry::new(path.to_string(), hash.to_string()),
        );
        self.inner.mark_dirty();
    }

    /// Forget `path`. Persisted by the next debounced flush.
    pub async fn delete(&self, path: &str) -> bool {
        let removed = self.inner.entries.write().await.remove(path).is_some();
        if removed {
            self.inner.mark_dirty();
        }
        removed
    }

    /// Independent copy of the path → hash map.
    pub async fn get_all(&self) -> HashMap<String, String> {
        self.inner
            .entries
            .read()
            .await
            .iter()
            .map(|(path, entry)| (path.clone(), entry.hash.clone()))
            .collect()
    }

    /// Independent copy of every entry.
    pub async fn entries(&self) -> Vec<FingerprintEntry> {
        self.inner.entries.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.entries.read().await.is_empty()
    }

    /// Record many fingerprints as one all-or-nothing durable write.
    pub async fn set_many<I>(&self, pairs: I) -> Result<(), FingerprintError>
    where
        I: IntoIterator<Item = (String, String)> + Send,
    {
        let pairs: Vec<(String, String)> = pairs.into_iter().collect();
        self.transact(move |entries| {
            for (path, hash) in pairs {
                entries.insert(path.clone(), FingerprintEntry::new(path, hash));
            }
        })
        .await
    }

    /// Remove many paths as one all-or-nothing durable write. Returns the
    /// paths that were present.
    pub async fn delete_many<I>(&self, paths: I) -> Result<Vec<String>, FingerprintError>
    where
        I: IntoIterator<Item = String> + Send,
    {
        let paths: Vec<String> = paths.into_iter().collect();
        self.transact(move |entries| {
            paths
                .into_iter()
                .filter(|p| entries.remove(p).is_some())
                .collect()
        })
        .await
    }

    /// Remove every entry whose path is not in `keep`, returning the removed
    /// paths so their vectors can be deleted too.
    pub async fn delete_hashes_not_in(
        &self,
        keep: &HashSet<String>,
    ) -> Result<Vec<String>, FingerprintError> {
        self.transact(|entries| {
            let mut removed: Vec<String> = entries
                .keys()
                .filter(|p| !keep.contains(*p))
                .cloned()
                .collect();
            for path in &removed {
                entries.remove(path);
            }
            removed.sort();
            removed
        })
        .await
    }

    /// Drop every entry, durably.
    pub async fn clear(&self) -> Result<(), FingerprintError> {
        self.transact(|entries| entries.clear()).await?;
        info!("Cleared fingerprint cache");
        Ok(())
    }

    /// Persist pending single-key writes now.
    pub async fn flush(&self) -> Result<(), FingerprintError> {
        self.inner.persist().await
    }

    /// Stop the background flusher after a final flush.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let handle = self.flusher.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        if let Err(e) = self.inner.persist().await {
            warn!("Final fingerprint flush failed: {}", e);
        }
    }

    async fn transact<R, F>(&self, mutate: F) -> Result<R, FingerprintError>
    where
        F: FnOnce(&mut HashMap<String, FingerprintEntry>) -> R + Send,
    {
        let _write = self.inner.write_lock.lock().await;
        let mut entries = self.inner.entries.write().await;
        let previous = entries.clone();
        let result = mutate(&mut entries);

        match self.inner.store.save(&entries).await {
            Ok(()) => {
                self.inner.dirty.store(false, Ordering::SeqCst);
                Ok(result)
            }
            Err(e) => {
                *entries = previous;
                Err(e)
            }
        }
    }
}

impl Drop for ContentFingerprintCache {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_flusher(inner: Arc<Inner>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = inner.notify.notified() => {}
        }

        // Wait for a quiet period so a burst of writes becomes one flush.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = inner.notify.notified() => continue,
                _ = tokio::time::sleep(inner.debounce) => break,
            }
        }

        if let Err(e) = inner.persist().await {
            warn!("Background fingerprint flush failed, retrying on next write: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    /// Store that counts saves and can be told to fail.
    #[derive(Default)]
    struct CountingStore {
        saves: AtomicUsize,
        fail: AtomicBool,
        saved: std::sync::Mutex<HashMap<String, FingerprintEntry>>,
    }

    #[async_trait]
    impl FingerprintStore for CountingStore {
        async fn load(&self) -> Result<HashMap<String, FingerprintEntry>, FingerprintError> {
            Ok(self.saved.lock().unwrap().clone())
        }

        async fn save(
            &self,
            entries: &HashMap<String, FingerprintEntry>,
        ) -> Result<(), FingerprintError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FingerprintError::Io(std::io::Error::other("disk full")));
            }
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.saved.lock().unwrap() = entries.clone();
            Ok(())
        }
    }

    async fn open_with(store: Arc<CountingStore>) -> ContentFingerprintCache {
        ContentFingerprintCache::open(store, Duration::from_millis(30))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = open_with(Arc::new(CountingStore::default())).await;

        assert!(cache.get("a.rs").await.is_none());
        cache.set("a.rs", "h1").await;
        assert_eq!(cache.get("a.rs").await, Some("h1".to_string()));

        assert!(cache.delete("a.rs").await);
        assert!(!cache.delete("a.rs").await);
        assert!(cache.get("a.rs").await.is_none());
    }

    #[tokio::test]
    async fn test_get_all_returns_independent_copy() {
        let cache = open_with(Arc::new(CountingStore::default())).await;
        cache.set("a.rs", "h1").await;

        let mut copy = cache.get_all().await;
        copy.insert("b.rs".to_string(), "h2".to_string());
        copy.remove("a.rs");

        assert_eq!(cache.get("a.rs").await, Some("h1".to_string()));
        assert!(cache.get("b.rs").await.is_none());
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_burst_of_sets_flushes_once() {
        let store = Arc::new(CountingStore::default());
        let cache = open_with(store.clone()).await;

        for i in 0..20 {
            cache.set(&format!("f{i}.rs"), "h").await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.saves.load(Ordering::SeqCst), 1);
        assert_eq!(store.saved.lock().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_background_flush_failure_is_retried_on_next_write() {
        let store = Arc::new(CountingStore::default());
        let cache = open_with(store.clone()).await;

        store.fail.store(true, Ordering::SeqCst);
        cache.set("a.rs", "h1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.saves.load(Ordering::SeqCst), 0);

        store.fail.store(false, Ordering::SeqCst);
        cache.set("b.rs", "h2").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let saved = store.saved.lock().unwrap().clone();
        assert!(saved.contains_key("a.rs"));
        assert!(saved.contains_key("b.rs"));
    }

    #[tokio::test]
    async fn test_set_many_then_get_all_round_trip() {
        let cache = open_with(Arc::new(CountingStore::default())).await;
        let pairs: HashMap<String, String> = [("a.rs", "h1"), ("src/b.rs", "h2"), ("c.ts", "h3")]
            .into_iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect();

        cache.set_many(pairs.clone()).await.unwrap();
        assert_eq!(cache.get_all().await, pairs);
    }

    #[tokio::test]
    async fn test_set_many_rolls_back_on_failure() {
        let store = Arc::new(CountingStore::default());
        let cache = open_with(store.clone()).await;
        cache
            .set_many(vec![("a.rs".to_string(), "h1".to_string())])
            .await
            .unwrap();
        let before = cache.get_all().await;

        store.fail.store(true, Ordering::SeqCst);
        let result = cache
            .set_many(vec![
                ("a.rs".to_string(), "changed".to_string()),
                ("b.rs".to_string(), "h2".to_string()),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(cache.get_all().await, before);
    }

    #[tokio::test]
    async fn test_delete_hashes_not_in() {
        let cache = open_with(Arc::new(CountingStore::default())).await;
        cache
            .set_many(vec![
                ("a.rs".to_string(), "h1".to_string()),
                ("b.rs".to_string(), "h2".to_string()),
                ("c.rs".to_string(), "h3".to_string()),
            ])
            .await
            .unwrap();

        let keep: HashSet<String> = ["b.rs".to_string(), "z.rs".to_string()].into_iter().collect();
        let removed = cache.delete_hashes_not_in(&keep).await.unwrap();

        assert_eq!(removed, vec!["a.rs".to_string(), "c.rs".to_string()]);
        let all = cache.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("b.rs"), Some(&"h2".to_string()));
    }

    #[tokio::test]
    async fn test_delete_hashes_not_in_rolls_back_on_failure() {
        let store = Arc::new(CountingStore::default());
        let cache = open_with(store.clone()).await;
        cache
            .set_many(vec![
                ("a.rs".to_string(), "h1".to_string()),
                ("b.rs".to_string(), "h2".to_string()),
            ])
            .await
            .unwrap();

        store.fail.store(true, Ordering::SeqCst);
        let result = cache.delete_hashes_not_in(&HashSet::new()).await;

        assert!(result.is_err());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_delete_many_reports_present_paths() {
        let cache = open_with(Arc::new(CountingStore::default())).await;
        cache
            .set_many(vec![("a.rs".to_string(), "h1".to_string())])
            .await
            .unwrap();

        let removed = cache
            .delete_many(vec!["a.rs".to_string(), "missing.rs".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["a.rs".to_string()]);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_json_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let store = Arc::new(JsonFileStore::for_workspace(dir.path(), Path::new("/work/repo")));

        let cache = ContentFingerprintCache::open(store.clone(), Duration::from_millis(10))
            .await
            .unwrap();
        cache.set("src/main.rs", "abc123").await;
        cache.set("src/lib.rs", "def456").await;
        cache.dispose().await;

        let reopened = ContentFingerprintCache::open(store, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reopened.get("src/main.rs").await, Some("abc123".to_string()));
        assert_eq!(reopened.get("src/lib.rs").await, Some("def456".to_string()));
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nope.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file_is_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fp.json");
        std::fs::write(&path, "{ not json").unwrap();
        let result = JsonFileStore::new(path).load().await;
        assert!(matches!(result, Err(FingerprintError::Parse(_))));
    }

    #[test]
    fn test_store_path_is_keyed_by_workspace() {
        let state = Path::new("/state");
        let a = JsonFileStore::for_workspace(state, Path::new("/work/a"));
        let b = JsonFileStore::for_workspace(state, Path::new("/work/b"));
        assert_ne!(a.path(), b.path());
        assert!(a.path().starts_with(state));
    }

    #[tokio::test]
    async fn test_clear_is_durable() {
        let store = Arc::new(CountingStore::default());
        let cache = open_with(store.clone()).await;
        cache.set("a.rs", "h1").await;
        cache.clear().await.unwrap();

        assert!(cache.is_empty().await);
        assert!(store.saved.lock().unwrap().is_empty());
    }
}
