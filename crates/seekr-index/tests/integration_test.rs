//! Integration tests for seekr-index.
//!
//! These drive a real on-disk workspace through the orchestrator, the
//! tree-sitter parser, the JSON fingerprint store and the in-memory vector
//! store, then query it through the search service.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{tempdir, TempDir};

use seekr_index::search::SearchCacheConfig;
use seekr_index::workspace::content_hash;
use seekr_index::{
    BranchChangeListener, ContentFingerprintCache, Embedder, FileEvent, IndexError,
    IndexOrchestrator, IndexState, InMemoryVectorStore, JsonFileStore, OrchestratorConfig,
    RegexKeywordSearcher, SearchService, TreeSitterParser, VectorStoreAdapter, WorkspaceFs,
};

const DIM: usize = 8;

/// Bag-of-words embedder: each word lands in one of `DIM` buckets.
#[derive(Default)]
struct BucketEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl Embedder for BucketEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0; DIM];
                for word in text.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
                    let bucket = word.bytes().map(usize::from).sum::<usize>() % DIM;
                    v[bucket] += 1.0;
                }
                v
            })
            .collect())
    }

    fn dimensions(&self) -> usize {
        DIM
    }

    fn model_name(&self) -> &str {
        "bucket"
    }
}

struct Workspace {
    root: TempDir,
    state: TempDir,
    store: Arc<InMemoryVectorStore>,
    embedder: Arc<BucketEmbedder>,
}

impl Workspace {
    fn new() -> Self {
        Self {
            root: tempdir().unwrap(),
            state: tempdir().unwrap(),
            store: Arc::new(InMemoryVectorStore::new("ws-integration", DIM)),
            embedder: Arc::new(BucketEmbedder::default()),
        }
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn write(&self, relative: &str, content: &str) {
        let path = self.root.path().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn remove(&self, relative: &str) {
        fs::remove_file(self.root.path().join(relative)).unwrap();
    }

    /// A fresh orchestrator over the same workspace, store and state
    /// directory, as after a process restart.
    async fn orchestrator(&self) -> Arc<IndexOrchestrator> {
        let fs = WorkspaceFs::new(
            self.path().to_path_buf(),
            vec!["ts".to_string(), "rs".to_string()],
            1024 * 1024,
        );
        let fingerprints = ContentFingerprintCache::open(
            Arc::new(JsonFileStore::for_workspace(self.state.path(), self.path())),
            Duration::from_millis(20),
        )
        .await
        .unwrap();
        Arc::new(IndexOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(fs),
            Arc::new(TreeSitterParser::new().unwrap()),
            self.embedder.clone(),
            self.store.clone(),
            Arc::new(fingerprints),
        ))
    }
}

fn ts_function(name: &str, body: &str) -> String {
    format!("export function {name}(input: string): string {{\n  return `{body}` + input;\n}}\n")
}

/// Edit, add and delete between two scans: only the edited and added files
/// are re-embedded, the deleted file loses its vectors and fingerprint.
#[tokio::test]
async fn test_incremental_scan_edit_add_delete() {
    let ws = Workspace::new();
    ws.write("a.ts", &ts_function("alpha", "first file"));
    ws.write("b.ts", &ts_function("beta", "second file"));

    let orchestrator = ws.orchestrator().await;
    let stats = orchestrator.start_indexing().await.unwrap();
    assert_eq!(stats.files_changed, 2);
    assert_eq!(ws.store.file_paths(), vec!["a.ts", "b.ts"]);
    let deletes_after_first_run = ws.store.delete_calls();

    let edited = ts_function("beta", "second file, edited");
    let added = ts_function("gamma", "third file");
    ws.write("b.ts", &edited);
    ws.write("c.ts", &added);
    ws.remove("a.ts");

    let stats = orchestrator.start_indexing().await.unwrap();
    assert_eq!(stats.files_changed, 2);
    assert_eq!(stats.files_deleted, 1);
    assert_eq!(stats.files_processed, 2);

    // One delete for a.ts, one to replace b.ts's stale segments.
    assert_eq!(ws.store.delete_calls() - deletes_after_first_run, 2);
    assert_eq!(ws.store.file_paths(), vec!["b.ts", "c.ts"]);

    let fingerprints = orchestrator.fingerprints().get_all().await;
    assert_eq!(fingerprints.len(), 2);
    assert_eq!(fingerprints["b.ts"], content_hash(edited.as_bytes()));
    assert_eq!(fingerprints["c.ts"], content_hash(added.as_bytes()));
    assert_eq!(orchestrator.state(), IndexState::Indexed);
}

#[tokio::test]
async fn test_fingerprints_survive_restart() {
    let ws = Workspace::new();
    ws.write("src/lib.rs", "pub fn add(left: usize, right: usize) -> usize {\n    left + right\n}\n");
    ws.write("src/util.rs", "pub fn double(value: usize) -> usize {\n    value * 2\n}\n");

    let first = ws.orchestrator().await;
    first.start_indexing().await.unwrap();
    first.dispose().await;
    let calls = ws.embedder.calls.load(Ordering::SeqCst);

    let second = ws.orchestrator().await;
    let stats = second.start_indexing().await.unwrap();
    assert_eq!(stats.files_scanned, 2);
    assert_eq!(stats.files_changed, 0);
    assert_eq!(ws.embedder.calls.load(Ordering::SeqCst), calls);
    assert!(ws.store.has_indexed_data().await.unwrap());
}

#[tokio::test]
async fn test_lost_collection_triggers_full_reindex() {
    let ws = Workspace::new();
    ws.write("a.ts", &ts_function("alpha", "first file"));

    let first = ws.orchestrator().await;
    first.start_indexing().await.unwrap();
    first.dispose().await;

    ws.store.delete_collection().await.unwrap();

    let second = ws.orchestrator().await;
    let stats = second.start_indexing().await.unwrap();
    assert_eq!(stats.files_changed, 1);
    assert_eq!(ws.store.file_paths(), vec!["a.ts"]);
}

#[tokio::test]
async fn test_branch_change_reindexes_new_tree() {
    let ws = Workspace::new();
    ws.write("main.ts", &ts_function("mainline", "on main"));

    let orchestrator = ws.orchestrator().await;
    orchestrator.start_indexing().await.unwrap();

    // Checkout swaps the working tree.
    ws.remove("main.ts");
    ws.write("feature.ts", &ts_function("feature", "on the feature branch"));
    orchestrator
        .on_branch_changed(Some("main"), Some("feature"))
        .await
        .unwrap();

    assert_eq!(orchestrator.state(), IndexState::Indexed);
    assert_eq!(ws.store.file_paths(), vec!["feature.ts"]);
    assert!(orchestrator.fingerprints().get("main.ts").await.is_none());
}

#[tokio::test]
async fn test_file_events_keep_index_current() {
    let ws = Workspace::new();
    ws.write("a.ts", &ts_function("alpha", "first file"));
    let orchestrator = ws.orchestrator().await;
    orchestrator.start_indexing().await.unwrap();

    ws.write("lib/b.ts", &ts_function("beta", "second file"));
    fs::rename(ws.path().join("a.ts"), ws.path().join("lib/a.ts")).unwrap();
    orchestrator
        .apply_file_events(&[
            FileEvent::Created("lib/b.ts".to_string()),
            FileEvent::Renamed("a.ts".to_string(), "lib/a.ts".to_string()),
        ])
        .await
        .unwrap();

    assert_eq!(ws.store.file_paths(), vec!["lib/a.ts", "lib/b.ts"]);
    let fingerprints = orchestrator.fingerprints().get_all().await;
    assert!(fingerprints.contains_key("lib/a.ts"));
    assert!(!fingerprints.contains_key("a.ts"));
}

#[tokio::test]
async fn test_search_after_indexing() {
    let ws = Workspace::new();
    ws.write("src/utils/a.ts", &ts_function("parseConfig", "parse config values"));
    ws.write("src/utilities/b.ts", &ts_function("parseConfigFile", "parse config file"));
    ws.write("src/utils/c.ts", &ts_function("renderTable", "draw rows"));

    let orchestrator = ws.orchestrator().await;
    let service = SearchService::new(
        true,
        orchestrator.subscribe(),
        ws.embedder.clone(),
        ws.store.clone(),
        SearchCacheConfig::default(),
    )
    .with_keyword_searcher(Arc::new(RegexKeywordSearcher::default()));

    // Nothing is searchable before the first run.
    let err = service.search("parse config", None, None).await.unwrap_err();
    assert!(matches!(err, IndexError::SearchUnavailable { .. }));

    orchestrator.start_indexing().await.unwrap();

    let results = service
        .search("parse config", Some("src/utils"), Some(ws.path()))
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.file_path.starts_with("src/utils/")));

    let all = service.search("parse config", None, Some(ws.path())).await.unwrap();
    let paths: Vec<_> = all.iter().map(|r| r.file_path.as_str()).collect();
    assert!(paths.contains(&"src/utilities/b.ts"));
    assert!(all.iter().any(|r| r.keyword_hits > 0));
}
